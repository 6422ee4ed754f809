//! Disk lifecycle monitor.
//!
//! The kernel announces a disk and its partitions as separate events and does
//! not promise their order, so the monitor cannot tell when enumeration is
//! complete. It waits instead: a disk becomes ready once no partition arrived
//! for longer than the debounce window, and only then is it handed to the
//! mount worker. The monitor runs in the event context and never blocks on
//! I/O; the job queue is its only link to the worker.

use crate::device::{BlockDevice, DeviceAction, DeviceEvent, DeviceKind, DiskId};
use crate::queue::JobQueue;
use crate::worker::{Disk, DiskRemoval, Job};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct DiskEntry {
    device: BlockDevice,
    attached: bool,
    partitions: Vec<BlockDevice>,
    last_partition: Instant,
    cancel: CancellationToken,
}

pub struct DiskMonitor {
    disks: HashMap<DiskId, DiskEntry>,
    queue: Arc<JobQueue<Job>>,
    debounce: Duration,
}

impl DiskMonitor {
    pub fn new(queue: Arc<JobQueue<Job>>, debounce: Duration) -> Self {
        Self {
            disks: HashMap::new(),
            queue,
            debounce,
        }
    }

    pub fn debounce_window(&self) -> Duration {
        self.debounce
    }

    /// Apply one hotplug event observed at `now`.
    pub fn handle_event(&mut self, event: DeviceEvent, now: Instant) {
        let id = match event.disk_id() {
            Ok(id) => id.clone(),
            Err(err) => {
                warn!("ignoring {:?} {:?} event: {err}", event.action, event.kind);
                return;
            }
        };

        match (event.action, event.kind) {
            (DeviceAction::Add, DeviceKind::Disk) => self.add_disk(id, event.device, now),
            (DeviceAction::Add, DeviceKind::Partition) => {
                self.add_partition(&id, event.device, now)
            }
            (DeviceAction::Remove, DeviceKind::Disk) => self.remove_disk(&id),
            (DeviceAction::Remove, DeviceKind::Partition) => {
                debug!("partition {} of disk {id} removed", event.device.name);
            }
        }
    }

    fn add_disk(&mut self, id: DiskId, device: BlockDevice, now: Instant) {
        if self.disks.contains_key(&id) {
            warn!("disk {id} ({}) announced twice; keeping the first", device.name);
            return;
        }

        debug!("new disk {id} at {}", device.devnode.display());
        self.disks.insert(
            id,
            DiskEntry {
                device,
                attached: false,
                partitions: Vec::new(),
                last_partition: now,
                cancel: CancellationToken::new(),
            },
        );
    }

    fn add_partition(&mut self, id: &DiskId, partition: BlockDevice, now: Instant) {
        match self.disks.get_mut(id) {
            Some(entry) if !entry.attached => {
                debug!("new partition {} on disk {id}", partition.name);
                entry.last_partition = now;
                entry.partitions.push(partition);
            }
            _ => warn!("ignore partition {} due to udev timeout", partition.name),
        }
    }

    fn remove_disk(&mut self, id: &DiskId) {
        let Some(entry) = self.disks.remove(id) else {
            debug!("removal of unknown disk {id}");
            return;
        };

        // cancel first so a running scan stops before the unmount job is seen
        entry.cancel.cancel();
        info!("{:>10} {}", "removed", entry.device.name);
        self.queue.push_back(Job::Unmount(DiskRemoval {
            id: id.clone(),
            device: entry.device,
        }));
    }

    /// Hand every disk that has been quiet for longer than the debounce
    /// window to the worker. Returns how many disks were promoted.
    pub fn debounce_tick(&mut self, now: Instant) -> usize {
        let mut ready: Vec<(&DiskId, &mut DiskEntry)> = self
            .disks
            .iter_mut()
            .filter(|(_, entry)| {
                !entry.attached
                    && now.saturating_duration_since(entry.last_partition) > self.debounce
            })
            .collect();
        ready.sort_by_key(|(_, entry)| entry.last_partition);

        let promoted = ready.len();
        for (id, entry) in ready {
            entry.attached = true;
            debug!(
                "disk {id} settled with {} partitions",
                entry.partitions.len()
            );
            self.queue.push_back(Job::Mount(Disk {
                id: id.clone(),
                device: entry.device.clone(),
                partitions: std::mem::take(&mut entry.partitions),
                cancel: entry.cancel.clone(),
            }));
        }
        promoted
    }

    /// Whether some disk is still waiting for its partitions to settle.
    pub fn has_pending(&self) -> bool {
        self.disks.values().any(|entry| !entry.attached)
    }

    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    pub fn is_known(&self, id: &DiskId) -> bool {
        self.disks.contains_key(id)
    }

    pub fn is_attached(&self, id: &DiskId) -> bool {
        self.disks.get(id).is_some_and(|entry| entry.attached)
    }

    /// Partitions collected so far for a disk that is not attached yet.
    pub fn partition_count(&self, id: &DiskId) -> Option<usize> {
        self.disks.get(id).map(|entry| entry.partitions.len())
    }

    /// Stop the worker: the sentinel jumps the queue, every known disk is
    /// cancelled, then we wait for the worker thread to finish.
    pub fn shutdown(self, worker: Option<JoinHandle<()>>) {
        self.queue.push_front(Job::Shutdown);
        for entry in self.disks.values() {
            entry.cancel.cancel();
        }

        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("mount worker panicked during shutdown");
            }
        }
    }
}
