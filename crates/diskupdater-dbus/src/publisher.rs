//! [`Publisher`] that exports bundles and daemon state on the bus.

use crate::installer::RaucInstaller;
use crate::objects::{bundle_path, BundleObject, ManagerObject};
use diskupdater_core::discovery::Bundle;
use diskupdater_core::error::{UpdaterError, UpdaterResult};
use diskupdater_core::publisher::{Publisher, Status};
use log::debug;
use zbus::blocking::Connection;

fn publish_error(err: zbus::Error) -> UpdaterError {
    UpdaterError::Publish(err.to_string())
}

enum ManagerChange {
    Status(Status),
    DeviceCount(u32),
}

pub struct DbusPublisher {
    conn: Connection,
    root: String,
    installer: RaucInstaller,
}

impl DbusPublisher {
    /// `conn` must already serve a [`ManagerObject`] at `root`.
    pub fn new(conn: Connection, root: impl Into<String>, installer: RaucInstaller) -> Self {
        Self {
            conn,
            root: root.into(),
            installer,
        }
    }

    fn update_manager(&self, change: ManagerChange) -> UpdaterResult<()> {
        let conn = self.conn.inner();
        let root = self.root.as_str();
        zbus::block_on(async move {
            let server = conn.object_server();
            let iface_ref = server.interface::<_, ManagerObject>(root).await?;
            let mut iface = iface_ref.get_mut().await;
            let emitter = iface_ref.signal_emitter();
            match change {
                ManagerChange::Status(status) if iface.status != status => {
                    iface.status = status;
                    iface.status_changed(emitter).await?;
                }
                ManagerChange::DeviceCount(count) if iface.device_count != count => {
                    iface.device_count = count;
                    iface.device_count_changed(emitter).await?;
                }
                _ => {}
            }
            Ok::<(), zbus::Error>(())
        })
        .map_err(publish_error)
    }
}

impl Publisher for DbusPublisher {
    fn publish_bundle(&mut self, index: u32, bundle: &Bundle) -> UpdaterResult<()> {
        let path = bundle_path(&self.root, index);
        let object = BundleObject::new(
            bundle.path.to_string_lossy().into_owned(),
            bundle.version.clone(),
            self.installer.proxy(),
        );
        let added = self
            .conn
            .object_server()
            .at(path.as_str(), object)
            .map_err(publish_error)?;
        if !added {
            return Err(UpdaterError::Publish(format!("{path} is already exported")));
        }
        debug!("exported {path}");
        Ok(())
    }

    fn withdraw_bundle(&mut self, index: u32) -> UpdaterResult<()> {
        let path = bundle_path(&self.root, index);
        self.conn
            .object_server()
            .remove::<BundleObject, _>(path.as_str())
            .map_err(publish_error)?;
        debug!("withdrew {path}");
        Ok(())
    }

    fn set_status(&mut self, status: Status) -> UpdaterResult<()> {
        self.update_manager(ManagerChange::Status(status))
    }

    fn set_device_count(&mut self, count: u32) -> UpdaterResult<()> {
        self.update_manager(ManagerChange::DeviceCount(count))
    }
}
