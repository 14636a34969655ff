//! Launch validation.
//!
//! # Responsibilities
//! - Reject networks without a preconfigured genesis
//! - Reject stderr levels configured twice
//! - Refuse to open a database written by a different engine
//!
//! # Design Decisions
//! - Every check runs before any process, socket, or plugin is started
//! - Checks are plain functions over already-parsed values

use crate::config::cli::LaunchArgs;
use crate::config::loader::read_engine_marker;
use crate::config::schema::{Network, NodeConfig};
use crate::config::ConfigError;

/// Map a network id onto a preconfigured network.
pub fn validate_network(network_id: u64) -> Result<Network, ConfigError> {
    Network::from_id(network_id).ok_or(ConfigError::UnsupportedNetwork(network_id))
}

/// A default `--log-level` and `--stderr-log-level` both set the stderr level.
pub fn validate_logging(args: &LaunchArgs) -> Result<(), ConfigError> {
    let has_default_level = args.log_levels.iter().any(|d| d.logger.is_none());
    if has_default_level && args.stderr_log_level.is_some() {
        return Err(ConfigError::AmbiguousLogging);
    }
    Ok(())
}

/// The configured engine must match the one recorded with the database.
pub fn validate_engine(config: &NodeConfig) -> Result<(), ConfigError> {
    match read_engine_marker(config)? {
        Some(marker) if marker.engine != config.db_engine => Err(ConfigError::EngineMismatch {
            configured: config.db_engine,
            on_disk: marker.engine,
            database_dir: config.database_dir(),
        }),
        _ => Ok(()),
    }
}
