//! Dedicated thread that performs every mount and unmount.
//!
//! Jobs arrive through a [`JobQueue`] and are processed strictly in order, one
//! disk at a time. Attach and detach notifications are delivered to a
//! [`DiskListener`] on this same thread, so the bundle pipeline for a disk has
//! finished (or been cancelled) before the disk's unmount job is looked at.

use crate::device::{BlockDevice, DiskId};
use crate::mounts::{ensure_mount_dir, mount_dir, Mounter, SupportedFilesystems};
use crate::queue::JobQueue;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

const WORKER_THREAD_NAME: &str = "process-device";

/// A disk whose partition set is considered complete.
#[derive(Debug, Clone)]
pub struct Disk {
    pub id: DiskId,
    pub device: BlockDevice,
    /// Partitions in the order they were announced.
    pub partitions: Vec<BlockDevice>,
    pub cancel: CancellationToken,
}

/// A disk that disappeared from the system.
#[derive(Debug, Clone)]
pub struct DiskRemoval {
    pub id: DiskId,
    pub device: BlockDevice,
}

#[derive(Debug)]
pub enum Job {
    Mount(Disk),
    Unmount(DiskRemoval),
    /// Unmount everything and stop the worker.
    Shutdown,
}

/// A disk after its partitions went through the mount pass.
#[derive(Debug, Clone)]
pub struct AttachedDisk {
    pub id: DiskId,
    pub device: BlockDevice,
    pub partitions: Vec<BlockDevice>,
    /// May be empty when no partition could be mounted.
    pub mount_points: Vec<PathBuf>,
    pub cancel: CancellationToken,
}

/// Receives attach and detach notifications on the worker thread.
pub trait DiskListener: Send {
    fn on_attach(&mut self, disk: &AttachedDisk);

    /// Called before the mount points are torn down.
    fn on_detach(&mut self, id: &DiskId, device: &BlockDevice, mount_points: &[PathBuf]);
}

pub struct MountWorker<M, L> {
    queue: Arc<JobQueue<Job>>,
    mounter: M,
    filesystems: SupportedFilesystems,
    mount_root: PathBuf,
    listener: L,
    attached: HashMap<DiskId, AttachedDisk>,
}

impl<M, L> MountWorker<M, L>
where
    M: Mounter + 'static,
    L: DiskListener + 'static,
{
    pub fn new(
        queue: Arc<JobQueue<Job>>,
        mounter: M,
        filesystems: SupportedFilesystems,
        mount_root: impl Into<PathBuf>,
        listener: L,
    ) -> Self {
        Self {
            queue,
            mounter,
            filesystems,
            mount_root: mount_root.into(),
            listener,
            attached: HashMap::new(),
        }
    }

    /// Run the worker on its own named thread.
    pub fn spawn(mut self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || self.run())
    }

    /// Process jobs until a [`Job::Shutdown`] is popped.
    pub fn run(&mut self) {
        loop {
            let job = self.queue.pop();
            if self.process(job).is_break() {
                break;
            }
        }
        debug!("mount worker stopped");
    }

    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    fn process(&mut self, job: Job) -> ControlFlow<()> {
        match job {
            Job::Mount(disk) => self.attach(disk),
            Job::Unmount(removal) => self.detach(removal),
            Job::Shutdown => {
                self.detach_all();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn attach(&mut self, disk: Disk) {
        if self.attached.contains_key(&disk.id) {
            warn!("disk {} is already attached; ignoring mount job", disk.id);
            return;
        }

        let mount_points: Vec<PathBuf> = disk
            .partitions
            .iter()
            .filter_map(|partition| self.mount_partition(partition))
            .collect();

        let attached = AttachedDisk {
            id: disk.id,
            device: disk.device,
            partitions: disk.partitions,
            mount_points,
            cancel: disk.cancel,
        };

        info!(
            "{:>10} {} ({} mount points)",
            "attached",
            attached.device.name,
            attached.mount_points.len()
        );
        self.listener.on_attach(&attached);
        self.attached.insert(attached.id.clone(), attached);
    }

    fn mount_partition(&self, partition: &BlockDevice) -> Option<PathBuf> {
        let Some(fstype) = partition.fs_type.as_deref() else {
            debug!("partition {} has no filesystem", partition.name);
            return None;
        };
        if !self.filesystems.supports(fstype) {
            debug!(
                "filesystem {fstype} on {} not supported by the kernel",
                partition.name
            );
            return None;
        }

        let target = mount_dir(&self.mount_root, &partition.name);
        if let Err(err) = ensure_mount_dir(&target) {
            warn!("could not create directory {}: {err}", target.display());
            return None;
        }

        if let Err(err) = self.mounter.mount(partition.devnode(), &target, fstype) {
            warn!("could not mount {}: {err}", partition.devnode.display());
            return None;
        }

        debug!(
            "mounted {} at {}",
            partition.devnode.display(),
            target.display()
        );
        Some(target)
    }

    fn detach(&mut self, removal: DiskRemoval) {
        match self.attached.remove(&removal.id) {
            Some(disk) => self.release(disk),
            None => {
                // removed before the debounce elapsed; nothing was mounted
                info!("{:>10} {}", "detached", removal.device.name);
                self.listener.on_detach(&removal.id, &removal.device, &[]);
            }
        }
    }

    fn detach_all(&mut self) {
        let disks: Vec<AttachedDisk> = self.attached.drain().map(|(_, disk)| disk).collect();
        for disk in disks {
            disk.cancel.cancel();
            self.release(disk);
        }
    }

    fn release(&mut self, disk: AttachedDisk) {
        info!("{:>10} {}", "detached", disk.device.name);
        self.listener
            .on_detach(&disk.id, &disk.device, &disk.mount_points);
        for mount_point in &disk.mount_points {
            self.unmount(mount_point);
        }
    }

    fn unmount(&self, mount_point: &Path) {
        if let Err(err) = self.mounter.unmount(mount_point) {
            warn!("could not unmount {}: {err}", mount_point.display());
        }
    }
}
