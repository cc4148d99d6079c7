//! Error types for sandbox-hotplug

use thiserror::Error;

/// Result type alias using sandbox-hotplug Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while attaching, detaching or restoring devices
#[derive(Error, Debug)]
pub enum Error {
    /// Attach bookkeeping is out of step (e.g. more detaches than attaches)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Block index exhausted or the receiver refused to hand one out
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    /// The receiver or hypervisor failed to add/remove a device
    #[error("Hotplug of {device_type} device {id} failed: {reason}")]
    HotplugFailure {
        id: String,
        device_type: String,
        reason: String,
    },

    /// Unrecognized type keyword
    #[error("Unknown {kind} type {value:?}")]
    UnknownType { kind: &'static str, value: String },

    /// Snapshot discriminator and payload disagree
    #[error("Inconsistent snapshot: {0}")]
    InconsistentSnapshot(String),

    /// Operation is not supported by this device or endpoint kind
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Host-side network plumbing errors
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn unknown_type(kind: &'static str, value: impl Into<String>) -> Self {
        Error::UnknownType {
            kind,
            value: value.into(),
        }
    }
}
