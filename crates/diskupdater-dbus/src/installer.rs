//! RAUC client on the system bus.

use diskupdater_core::error::{UpdaterError, UpdaterResult};
use diskupdater_core::installer::{BundleInfo, Installer};
use log::debug;
use std::path::Path;
use zbus::blocking::Connection;

#[zbus::proxy(
    interface = "de.pengutronix.rauc.Installer",
    default_service = "de.pengutronix.rauc",
    default_path = "/",
    async_name = "RaucInstallerProxy",
    blocking_name = "RaucInstallerProxyBlocking"
)]
pub trait RaucInstallerService {
    /// Returns `(compatible, version)` of the bundle at `bundle`.
    fn info(&self, bundle: &str) -> zbus::Result<(String, String)>;

    fn install(&self, source: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn compatible(&self) -> zbus::Result<String>;
}

/// Keep the service's own error name and message so callers see them unchanged.
pub(crate) fn call_error(err: zbus::Error) -> UpdaterError {
    match err {
        zbus::Error::MethodError(name, message, _) => {
            let name = name.to_string();
            let message = message.unwrap_or_else(|| name.clone());
            UpdaterError::installer_call(Some(name), message)
        }
        other => UpdaterError::Installer(other.to_string()),
    }
}

fn path_str(path: &Path) -> UpdaterResult<&str> {
    path.to_str().ok_or_else(|| {
        UpdaterError::Installer(format!("bundle path {} is not valid UTF-8", path.display()))
    })
}

/// [`Installer`] backed by `de.pengutronix.rauc.Installer`.
#[derive(Clone)]
pub struct RaucInstaller {
    proxy: RaucInstallerProxyBlocking<'static>,
}

impl RaucInstaller {
    pub fn new(conn: &Connection, service: &str) -> UpdaterResult<Self> {
        let proxy = RaucInstallerProxyBlocking::builder(conn)
            .destination(service.to_owned())
            .and_then(|builder| builder.build())
            .map_err(|err| UpdaterError::Installer(format!("cannot reach {service}: {err}")))?;
        Ok(Self { proxy })
    }

    /// Async flavour of the same proxy, for bus method handlers.
    pub fn proxy(&self) -> RaucInstallerProxy<'static> {
        RaucInstallerProxy::from(self.proxy.inner().inner().clone())
    }
}

impl Installer for RaucInstaller {
    fn compatible(&self) -> UpdaterResult<String> {
        self.proxy.compatible().map_err(call_error)
    }

    fn inspect(&self, bundle: &Path) -> UpdaterResult<BundleInfo> {
        debug!("inspecting {}", bundle.display());
        let (compatible, version) = self.proxy.info(path_str(bundle)?).map_err(call_error)?;
        Ok(BundleInfo {
            compatible,
            version,
        })
    }

    fn install(&self, bundle: &Path) -> UpdaterResult<()> {
        self.proxy.install(path_str(bundle)?).map_err(call_error)
    }
}
