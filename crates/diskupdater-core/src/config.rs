//! Configuration model for the disk updater daemon.

use crate::error::{UpdaterError, UpdaterResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/disk-updater.toml";
pub const CONFIG_PATH_ENV: &str = "DISK_UPDATER_CONFIG";

/// Hotplug and mount behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorCfg {
    /// Quiet period after the last partition event before a disk is mounted.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// File listing the filesystem types the kernel can mount.
    #[serde(default = "default_filesystems_file")]
    pub filesystems_file: PathBuf,

    /// Feed USB disks that are already present at startup to the monitor.
    #[serde(default)]
    pub scan_existing: bool,

    #[serde(default)]
    pub read_only: bool,
}

fn default_debounce_ms() -> u64 {
    1_000
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/run/media/disk-updater")
}

fn default_filesystems_file() -> PathBuf {
    PathBuf::from("/proc/filesystems")
}

impl Default for MonitorCfg {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            mount_root: default_mount_root(),
            filesystems_file: default_filesystems_file(),
            scan_existing: false,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlesCfg {
    #[serde(default = "default_bundle_suffix")]
    pub suffix: String,
}

fn default_bundle_suffix() -> String {
    ".raucb".to_string()
}

impl Default for BundlesCfg {
    fn default() -> Self {
        Self {
            suffix: default_bundle_suffix(),
        }
    }
}

/// External policy hook deciding which bundle gets installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCfg {
    #[serde(default)]
    pub script: Option<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    25
}

impl Default for HookCfg {
    fn default() -> Self {
        Self {
            script: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Names used on the system bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbusCfg {
    #[serde(default = "default_bus_name")]
    pub bus_name: String,

    #[serde(default = "default_object_path")]
    pub object_path: String,

    #[serde(default = "default_installer_service")]
    pub installer_service: String,
}

fn default_bus_name() -> String {
    "de.helbling.DiskUpdater".to_string()
}

fn default_object_path() -> String {
    "/de/helbling/DiskUpdater".to_string()
}

fn default_installer_service() -> String {
    "de.pengutronix.rauc".to_string()
}

impl Default for DbusCfg {
    fn default() -> Self {
        Self {
            bus_name: default_bus_name(),
            object_path: default_object_path(),
            installer_service: default_installer_service(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub monitor: MonitorCfg,

    #[serde(default)]
    pub bundles: BundlesCfg,

    #[serde(default)]
    pub hook: HookCfg,

    #[serde(default)]
    pub dbus: DbusCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl UpdaterConfig {
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the config path: explicit argument, then environment, then default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match env::var(CONFIG_PATH_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load the configuration, falling back to defaults when the system-wide
    /// file does not exist. Any other missing path is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> UpdaterResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        if target != Self::default_path() {
            return Err(UpdaterError::InvalidConfig(format!(
                "configuration file {} does not exist",
                target.display()
            )));
        }

        debug!(
            "no configuration at {}; using built-in defaults",
            target.display()
        );
        Ok(Self {
            path: target.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file from disk, detect its format, and check it.
    pub fn load<P: AsRef<Path>>(path: P) -> UpdaterResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(UpdaterError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Return human-readable problems with the current values.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.monitor.debounce_ms == 0 {
            issues.push("monitor.debounce_ms must be greater than 0".to_string());
        }
        if !self.monitor.mount_root.is_absolute() {
            issues.push(format!(
                "monitor.mount_root must be an absolute path (got {})",
                self.monitor.mount_root.display()
            ));
        }
        if self.bundles.suffix.trim().is_empty() {
            issues.push("bundles.suffix must not be empty".to_string());
        }
        if self.hook.poll_interval_ms == 0 {
            issues.push("hook.poll_interval_ms must be greater than 0".to_string());
        }
        if !self.dbus.object_path.starts_with('/') {
            issues.push(format!(
                "dbus.object_path must start with '/' (got {})",
                self.dbus.object_path
            ));
        }
        if self.dbus.bus_name.trim().is_empty() {
            issues.push("dbus.bus_name must not be empty".to_string());
        }

        issues
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.monitor.debounce_ms)
    }

    pub fn hook_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hook.poll_interval_ms)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> UpdaterResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}
