use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XpcRemoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Package archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Device command timed out after {timeout:?}: {command}")]
    DeviceTimeout { command: String, timeout: Duration },

    #[error("Device is no longer reachable: {0}")]
    DeviceLost(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Device property '{0}' is unavailable")]
    PropertyUnavailable(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl XpcRemoteError {
    /// Returns true for the device-level timeout signal.
    pub fn is_timeout(&self) -> bool {
        matches!(self, XpcRemoteError::DeviceTimeout { .. })
    }

    /// Returns true when the device connection is gone for good.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, XpcRemoteError::DeviceLost(_))
    }

    /// Errors worth another attempt under the bounded retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, XpcRemoteError::PropertyUnavailable(_))
    }
}

pub type Error = XpcRemoteError;
pub type Result<T> = std::result::Result<T, Error>;
