use thiserror::Error;

use fleet_core::DeviceError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Invalid device selection criteria: {0}")]
    Validation(String),

    #[error("Remote-control protocol error: {0}")]
    RemoteProtocol(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Configuration could not be re-derived from args: {0}")]
    ConfigurationNotRederivable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
