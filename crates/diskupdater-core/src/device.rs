//! Block device model shared by the event source, the monitor and the worker.

use crate::error::{UpdaterError, UpdaterResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable identifier of a physical disk (the partition table UUID).
///
/// Partitions carry the identifier of the table they belong to, which is what
/// lets the monitor group them under their disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskId(String);

impl DiskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Remove,
}

/// Snapshot of the properties we need from a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name, e.g. `sdb1`.
    pub name: String,
    /// Device node, e.g. `/dev/sdb1`.
    pub devnode: PathBuf,
    /// Filesystem type reported by blkid (`ID_FS_TYPE`).
    pub fs_type: Option<String>,
}

impl BlockDevice {
    pub fn new(name: impl Into<String>, devnode: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            devnode: devnode.into(),
            fs_type: None,
        }
    }

    pub fn with_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type.into());
        self
    }

    pub fn devnode(&self) -> &Path {
        &self.devnode
    }
}

/// One add/remove notification for a disk or partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub kind: DeviceKind,
    pub disk_id: Option<DiskId>,
    pub device: BlockDevice,
}

impl DeviceEvent {
    pub fn new(
        action: DeviceAction,
        kind: DeviceKind,
        disk_id: Option<DiskId>,
        device: BlockDevice,
    ) -> Self {
        Self {
            action,
            kind,
            disk_id,
            device,
        }
    }

    /// The owning disk's identifier; absent or blank identifiers are an error
    /// so unpartitioned media never collide in the registry.
    pub fn disk_id(&self) -> UpdaterResult<&DiskId> {
        match &self.disk_id {
            Some(id) if !id.as_str().trim().is_empty() => Ok(id),
            _ => Err(UpdaterError::MissingDiskId {
                device: self.device.name.clone(),
            }),
        }
    }
}
