//! Contract for the exported management objects.

use crate::discovery::Bundle;
use crate::error::UpdaterResult;
use std::fmt;

/// Activity reported on the root management object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Idle,
    Scanning,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Scanning => "scanning",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exposes bundles and daemon state to management clients.
///
/// Implementations are called from the worker thread only.
pub trait Publisher: Send {
    /// Export `bundle` as object number `index`.
    fn publish_bundle(&mut self, index: u32, bundle: &Bundle) -> UpdaterResult<()>;

    /// Withdraw the object previously exported as `index`.
    fn withdraw_bundle(&mut self, index: u32) -> UpdaterResult<()>;

    fn set_status(&mut self, status: Status) -> UpdaterResult<()>;

    fn set_device_count(&mut self, count: u32) -> UpdaterResult<()>;
}
