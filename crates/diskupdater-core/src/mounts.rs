//! Mount syscalls and the kernel's supported-filesystem list.

use crate::error::{UpdaterError, UpdaterResult};
use log::warn;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Filesystem types the running kernel can mount from a block device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportedFilesystems {
    types: HashSet<String>,
}

impl SupportedFilesystems {
    /// Parse `/proc/filesystems`. Lines flagged `nodev` are virtual filesystems
    /// and never match a partition.
    pub fn parse(contents: &str) -> Self {
        let types = contents
            .lines()
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                match (tokens.next(), tokens.next()) {
                    (Some(fstype), None) => Some(fstype.to_string()),
                    _ => None,
                }
            })
            .collect();
        Self { types }
    }

    /// Read the list once. An unreadable file yields an empty list, so every
    /// partition is skipped rather than mounted blindly.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) => {
                warn!("error reading {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn supports(&self, fstype: &str) -> bool {
        self.types.contains(fstype)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Deterministic mount directory for a partition.
pub fn mount_dir(root: &Path, partition_name: &str) -> PathBuf {
    root.join(partition_name)
}

/// Create `dir` and its parents; an existing directory is fine.
pub fn ensure_mount_dir(dir: &Path) -> UpdaterResult<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(UpdaterError::Mount {
            target: dir.to_path_buf(),
            source: err,
        }),
    }
}

/// The syscalls the mount worker needs.
pub trait Mounter: Send {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> UpdaterResult<()>;

    /// Lazily detach `target`. A target that is not mounted is not an error.
    fn unmount(&self, target: &Path) -> UpdaterResult<()>;
}

/// `mount(2)`/`umount2(2)` on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter {
    read_only: bool,
}

impl SystemMounter {
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }

    fn flags(&self) -> MsFlags {
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        if self.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        flags
    }
}

impl Mounter for SystemMounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> UpdaterResult<()> {
        mount(Some(source), target, Some(fstype), self.flags(), None::<&str>).map_err(|errno| {
            UpdaterError::Mount {
                target: target.to_path_buf(),
                source: io::Error::from(errno),
            }
        })
    }

    fn unmount(&self, target: &Path) -> UpdaterResult<()> {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) => Ok(()),
            Err(errno) => Err(UpdaterError::Mount {
                target: target.to_path_buf(),
                source: io::Error::from(errno),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PROC_FILESYSTEMS: &str = "nodev\tsysfs\nnodev\ttmpfs\nnodev\tproc\n\text4\n\tvfat\n\texfat\nnodev\tfuse\n\tfuseblk\n";

    #[test]
    fn parse_keeps_block_filesystems_only() {
        let filesystems = SupportedFilesystems::parse(PROC_FILESYSTEMS);
        assert!(filesystems.supports("ext4"));
        assert!(filesystems.supports("vfat"));
        assert!(filesystems.supports("fuseblk"));
        assert!(!filesystems.supports("tmpfs"));
        assert!(!filesystems.supports("nodev"));
        assert!(!filesystems.supports("ntfs"));
        assert_eq!(filesystems.len(), 4);
    }

    #[test]
    fn load_reads_file_and_tolerates_missing_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("filesystems");
        fs::write(&path, PROC_FILESYSTEMS).unwrap();
        assert!(SupportedFilesystems::load(&path).supports("exfat"));

        let missing = SupportedFilesystems::load(&dir.path().join("absent"));
        assert!(missing.is_empty());
    }

    #[test]
    fn mount_dir_is_derived_from_partition_name() {
        let root = Path::new("/run/media/disk-updater");
        assert_eq!(
            mount_dir(root, "sdb1"),
            PathBuf::from("/run/media/disk-updater/sdb1")
        );
    }

    #[test]
    fn ensure_mount_dir_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("media").join("sdb1");
        ensure_mount_dir(&target).unwrap();
        ensure_mount_dir(&target).unwrap();
        assert!(target.is_dir());
    }
}
