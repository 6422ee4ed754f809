//! System bus side of the disk updater.
//!
//! One connection is shared by the RAUC client and the exported management
//! objects. The connection dispatches incoming method calls on zbus' own
//! executor, so bus clients are served while the mount worker is busy.

pub mod installer;
pub mod objects;
pub mod publisher;

pub use installer::{RaucInstaller, RaucInstallerProxy, RaucInstallerProxyBlocking};
pub use objects::{bundle_path, BundleObject, ManagerObject, BUNDLE_INTERFACE, MANAGER_INTERFACE};
pub use publisher::DbusPublisher;

use diskupdater_core::config::DbusCfg;
use diskupdater_core::error::{UpdaterError, UpdaterResult};
use log::info;
use zbus::blocking::Connection;

/// System bus connection plus the installer client built on it.
pub struct Bus {
    conn: Connection,
    installer: RaucInstaller,
    object_path: String,
}

impl Bus {
    /// Connect to the system bus and resolve the installer service.
    ///
    /// Errors are reported as [`UpdaterError::Installer`]: without the bus
    /// there is no installer to talk to.
    pub fn connect(config: &DbusCfg) -> UpdaterResult<Self> {
        let conn = Connection::system().map_err(|err| {
            UpdaterError::Installer(format!("cannot connect to the system bus: {err}"))
        })?;
        let installer = RaucInstaller::new(&conn, &config.installer_service)?;
        Ok(Self {
            conn,
            installer,
            object_path: config.object_path.clone(),
        })
    }

    pub fn installer(&self) -> &RaucInstaller {
        &self.installer
    }

    /// Export the root object and claim `bus_name`.
    ///
    /// Fails with [`UpdaterError::Publish`] when the name is owned elsewhere.
    pub fn serve(&self, bus_name: &str) -> UpdaterResult<DbusPublisher> {
        let added = self
            .conn
            .object_server()
            .at(self.object_path.as_str(), ManagerObject::default())
            .map_err(|err| UpdaterError::Publish(err.to_string()))?;
        if !added {
            return Err(UpdaterError::Publish(format!(
                "{} is already exported",
                self.object_path
            )));
        }

        self.conn.request_name(bus_name).map_err(|err| {
            UpdaterError::Publish(format!("cannot acquire bus name {bus_name}: {err}"))
        })?;
        info!("serving {bus_name} at {}", self.object_path);

        Ok(DbusPublisher::new(
            self.conn.clone(),
            self.object_path.clone(),
            self.installer.clone(),
        ))
    }
}
