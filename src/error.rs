//! Fatal launch errors.

use thiserror::Error;

use crate::config::ConfigError;
use crate::ipc::{BrokerError, ChannelError};
use crate::lifecycle::pidfile::PidFileError;
use crate::lifecycle::process::ProcessError;
use crate::node::ServiceError;
use crate::observability::logging::LoggingError;
use crate::plugins::PluginError;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("event broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("event channel: {0}")]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("networking process: {0}")]
    Process(#[from] ProcessError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("invalid launch payload: {0}")]
    Payload(String),
}

impl LaunchError {
    /// Errors caused by how skein was invoked, reported before anything started.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, LaunchError::Config(_))
    }
}
