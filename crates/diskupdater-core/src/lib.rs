//! Core building blocks of the disk updater.
//!
//! The monitor turns block-device hotplug events into mount jobs, the worker
//! mounts and unmounts partitions on its own thread, and the updater scans the
//! mounted filesystems for RAUC bundles and decides which one to install. Bus
//! integration and the udev event source live in the sibling crates.

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod hook;
pub mod installer;
pub mod logging;
pub mod monitor;
pub mod mounts;
pub mod publisher;
pub mod queue;
pub mod updater;
pub mod worker;

pub use config::{ConfigFormat, UpdaterConfig, DEFAULT_CONFIG_PATH};
pub use device::{BlockDevice, DeviceAction, DeviceEvent, DeviceKind, DiskId};
pub use discovery::{Bundle, BundleCounter, BundleScanner};
pub use error::{UpdaterError, UpdaterResult};
pub use hook::{HookDecision, PolicyHook};
pub use installer::{BundleInfo, Installer};
pub use monitor::DiskMonitor;
pub use mounts::{Mounter, SupportedFilesystems, SystemMounter};
pub use publisher::{Publisher, Status};
pub use queue::JobQueue;
pub use updater::Updater;
pub use worker::{AttachedDisk, Disk, DiskListener, DiskRemoval, Job, MountWorker};
