//! Error type shared by the disk updater crates.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type UpdaterResult<T> = Result<T, UpdaterError>;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The installer service could not be reached or answered nonsense.
    #[error("installer service: {0}")]
    Installer(String),

    /// An error returned by the installer service for a specific call.
    #[error("{message}")]
    InstallerCall {
        name: Option<String>,
        message: String,
    },

    #[error("mount operation on {target} failed: {source}")]
    Mount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("policy hook: {0}")]
    Hook(String),

    #[error("block device {device} carries no partition table identifier")]
    MissingDiskId { device: String },

    #[error("failed to publish bus object: {0}")]
    Publish(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl UpdaterError {
    /// Build an installer call error carrying the service's own error name.
    pub fn installer_call(name: Option<String>, message: impl Into<String>) -> Self {
        UpdaterError::InstallerCall {
            name,
            message: message.into(),
        }
    }
}
