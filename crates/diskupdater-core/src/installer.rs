//! Contract for the external installer service (RAUC).
//!
//! The daemon talks to RAUC over the system bus; tests substitute an in-memory
//! double. Compatibility and signature checks are entirely the service's job.

use crate::error::UpdaterResult;
use std::path::Path;

/// Metadata the installer reports for a bundle file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo {
    pub compatible: String,
    pub version: String,
}

pub trait Installer: Send + Sync {
    /// The running system's compatible string.
    fn compatible(&self) -> UpdaterResult<String>;

    /// Read compatible string and version from a bundle file.
    fn inspect(&self, bundle: &Path) -> UpdaterResult<BundleInfo>;

    /// Ask the service to install the bundle at `bundle`.
    fn install(&self, bundle: &Path) -> UpdaterResult<()>;
}

impl<T: Installer + ?Sized> Installer for std::sync::Arc<T> {
    fn compatible(&self) -> UpdaterResult<String> {
        (**self).compatible()
    }

    fn inspect(&self, bundle: &Path) -> UpdaterResult<BundleInfo> {
        (**self).inspect(bundle)
    }

    fn install(&self, bundle: &Path) -> UpdaterResult<()> {
        (**self).install(bundle)
    }
}
