//! Objects exported under the management bus name.

use crate::installer::RaucInstallerProxy;
use diskupdater_core::publisher::Status;
use log::info;

pub const MANAGER_INTERFACE: &str = "de.helbling.DiskUpdater";
pub const BUNDLE_INTERFACE: &str = "de.helbling.DiskUpdater.Bundle";

/// Object path of bundle number `index` below the root object.
pub fn bundle_path(root: &str, index: u32) -> String {
    format!("{}/bundles/{index}", root.trim_end_matches('/'))
}

/// Root object: how many disks are attached and whether a scan is running.
#[derive(Debug, Default)]
pub struct ManagerObject {
    pub(crate) device_count: u32,
    pub(crate) status: Status,
}

#[zbus::interface(name = "de.helbling.DiskUpdater")]
impl ManagerObject {
    #[zbus(property)]
    fn device_count(&self) -> u32 {
        self.device_count
    }

    #[zbus(property)]
    fn status(&self) -> String {
        self.status.as_str().to_string()
    }
}

/// One compatible bundle found on an attached disk.
pub struct BundleObject {
    path: String,
    version: String,
    installer: RaucInstallerProxy<'static>,
}

impl BundleObject {
    pub fn new(path: String, version: String, installer: RaucInstallerProxy<'static>) -> Self {
        Self {
            path,
            version,
            installer,
        }
    }
}

#[zbus::interface(name = "de.helbling.DiskUpdater.Bundle")]
impl BundleObject {
    #[zbus(property)]
    fn path(&self) -> String {
        self.path.clone()
    }

    #[zbus(property)]
    fn version(&self) -> String {
        self.version.clone()
    }

    /// Forward to RAUC; its reply, error included, goes back to the caller.
    async fn install(&self) -> zbus::fdo::Result<()> {
        info!("{:>10} {} (requested)", "install", self.path);
        self.installer.install(&self.path).await.map_err(Into::into)
    }
}
