//! udev as the source of block-device events.

use diskupdater_core::{BlockDevice, DeviceAction, DeviceEvent, DeviceKind, DiskId};
use log::debug;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tokio::io::unix::AsyncFd;
use udev::{Device, Enumerator, EventType, MonitorBuilder, MonitorSocket};

/// Property carrying the partition table UUID shared by a disk and its partitions.
const DISK_ID_PROPERTY: &str = "ID_PART_TABLE_UUID";

fn os_str_to_str(value: &OsStr) -> Option<&str> {
    value.to_str()
}

fn property<'a>(device: &'a Device, key: &str) -> Option<&'a str> {
    device.property_value(key).and_then(os_str_to_str)
}

fn kind_of(devtype: Option<&str>) -> Option<DeviceKind> {
    match devtype? {
        "disk" => Some(DeviceKind::Disk),
        "partition" => Some(DeviceKind::Partition),
        _ => None,
    }
}

fn action_of(event_type: EventType) -> Option<DeviceAction> {
    match event_type {
        EventType::Add => Some(DeviceAction::Add),
        EventType::Remove => Some(DeviceAction::Remove),
        _ => None,
    }
}

/// Assemble an event from the udev properties we care about. Blank values
/// count as absent.
fn build_event(
    action: DeviceAction,
    kind: DeviceKind,
    name: &str,
    devnode: &Path,
    fs_type: Option<&str>,
    disk_id: Option<&str>,
) -> DeviceEvent {
    let mut device = BlockDevice::new(name, devnode);
    if let Some(fs_type) = fs_type.filter(|value| !value.is_empty()) {
        device = device.with_fs_type(fs_type);
    }
    let disk_id = disk_id.filter(|value| !value.is_empty()).map(DiskId::new);
    DeviceEvent::new(action, kind, disk_id, device)
}

/// Translate a udev device into a monitor event; `None` for devices that are
/// neither disks nor partitions or have no device node.
fn to_event(device: &Device, action: DeviceAction) -> Option<DeviceEvent> {
    let kind = kind_of(device.devtype().and_then(os_str_to_str))?;
    let name = device.sysname().to_string_lossy();
    let Some(devnode) = device.devnode() else {
        debug!("block device {name} has no device node");
        return None;
    };

    Some(build_event(
        action,
        kind,
        &name,
        devnode,
        property(device, "ID_FS_TYPE"),
        property(device, DISK_ID_PROPERTY),
    ))
}

/// Disks on the USB bus that were plugged in before we started listening,
/// as synthetic add events with disks ahead of their partitions.
pub fn existing_usb_devices() -> io::Result<Vec<DeviceEvent>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("block")?;
    enumerator.match_property("ID_BUS", "usb")?;

    let mut events: Vec<DeviceEvent> = enumerator
        .scan_devices()?
        .filter_map(|device| to_event(&device, DeviceAction::Add))
        .collect();
    events.sort_by_key(|event| event.kind != DeviceKind::Disk);
    Ok(events)
}

/// Non-blocking udev monitor socket registered with the tokio reactor.
pub struct UdevSource {
    socket: AsyncFd<MonitorSocket>,
}

impl UdevSource {
    pub fn new() -> io::Result<Self> {
        let socket = MonitorBuilder::new()?.match_subsystem("block")?.listen()?;
        Ok(Self {
            socket: AsyncFd::new(socket)?,
        })
    }

    /// Wait until the socket is readable and drain every pending event.
    pub async fn next_events(&mut self) -> io::Result<Vec<DeviceEvent>> {
        let mut guard = self.socket.readable().await?;
        let events = guard
            .get_inner()
            .iter()
            .filter_map(|event| {
                let action = action_of(event.event_type())?;
                to_event(&event.device(), action)
            })
            .collect();
        guard.clear_ready();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_disks_and_partitions_are_tracked() {
        assert_eq!(kind_of(Some("disk")), Some(DeviceKind::Disk));
        assert_eq!(kind_of(Some("partition")), Some(DeviceKind::Partition));
        assert_eq!(kind_of(Some("loop")), None);
        assert_eq!(kind_of(None), None);
    }

    #[test]
    fn change_and_bind_events_are_ignored() {
        assert_eq!(action_of(EventType::Add), Some(DeviceAction::Add));
        assert_eq!(action_of(EventType::Remove), Some(DeviceAction::Remove));
        assert_eq!(action_of(EventType::Change), None);
        assert_eq!(action_of(EventType::Bind), None);
    }

    #[test]
    fn blank_properties_count_as_missing() {
        let event = build_event(
            DeviceAction::Add,
            DeviceKind::Partition,
            "sdb1",
            Path::new("/dev/sdb1"),
            Some(""),
            Some(""),
        );
        assert_eq!(event.device.fs_type, None);
        assert!(event.disk_id().is_err());

        let event = build_event(
            DeviceAction::Add,
            DeviceKind::Partition,
            "sdb1",
            Path::new("/dev/sdb1"),
            Some("vfat"),
            Some("8e1f9c2a"),
        );
        assert_eq!(event.device.fs_type.as_deref(), Some("vfat"));
        assert_eq!(event.disk_id().unwrap().as_str(), "8e1f9c2a");
        assert_eq!(event.device.devnode(), Path::new("/dev/sdb1"));
    }
}
