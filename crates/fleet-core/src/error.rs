use std::io;
use thiserror::Error;

/// The classification a [`DeviceError`] falls into, used by the device-operation
/// retry wrapper to decide whether to call `recover()` and retry, or give up.
///
/// Mirrors the error-handling taxonomy one-to-one: transient failures are
/// retried after recovery, "gone"/"wedged" are terminal dispositions for the
/// device, logic errors are never retried, and fatal-host errors escalate to
/// a full scheduler shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timed out, IO hiccup, command rejected, shell unresponsive, sync
    /// buffer/protocol error, or install error: recover and retry.
    Transient,
    /// The device could not be brought back to a usable state at all.
    Gone,
    /// The device is reachable but has stopped responding mid-command.
    Wedged,
    /// A programming/configuration error; retrying will not help.
    Logic,
    /// A process-wide failure unrelated to any one device.
    Fatal,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Timeout occurred while {action}")]
    Timeout { action: String },

    #[error("Command rejected by device: {0}")]
    CommandRejected(String),

    #[error("Shell became unresponsive: {0}")]
    ShellUnresponsive(String),

    #[error("Sync buffer overrun: {0}")]
    SyncBufferOverrun(String),

    #[error("Sync protocol error: {0}")]
    SyncProtocolError(String),

    #[error("Sync logic error: {0}")]
    SyncLogicError(String),

    #[error("Install error: {0}")]
    InstallError(String),

    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    #[error("Device unresponsive: {0}")]
    DeviceUnresponsive(String),

    #[error("Invalid device selection criteria: {0}")]
    InvalidSelection(String),

    #[error("Configuration could not be re-derived from args: {0}")]
    ConfigurationNotRederivable(String),

    #[error("Fatal host error: {0}")]
    FatalHost(String),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Operation was interrupted: {0}")]
    Interrupted(String),

    #[error("Fastboot command failed: {0}")]
    FastbootError(String),
}

impl DeviceError {
    pub fn timeout(action: impl Into<String>) -> Self {
        Self::Timeout {
            action: action.into(),
        }
    }

    /// Classify this error per the error-handling taxonomy.
    pub fn classify(&self) -> FailureClass {
        match self {
            DeviceError::IoError(_)
            | DeviceError::Timeout { .. }
            | DeviceError::CommandRejected(_)
            | DeviceError::ShellUnresponsive(_)
            | DeviceError::SyncBufferOverrun(_)
            | DeviceError::SyncProtocolError(_)
            | DeviceError::InstallError(_)
            | DeviceError::FastbootError(_) => FailureClass::Transient,

            DeviceError::DeviceNotAvailable(_) => FailureClass::Gone,
            DeviceError::DeviceUnresponsive(_) => FailureClass::Wedged,

            DeviceError::SyncLogicError(_)
            | DeviceError::InvalidSelection(_)
            | DeviceError::ConfigurationNotRederivable(_)
            | DeviceError::RegexError(_) => FailureClass::Logic,

            DeviceError::FatalHost(_) => FailureClass::Fatal,

            // An interruption during a retryable wait is a transient hiccup;
            // the caller decides whether to retry or propagate it further.
            DeviceError::Interrupted(_) => FailureClass::Transient,
        }
    }
}
