//! Node configuration.
//!
//! `NodeConfig` is built once from the command line and the environment,
//! then shipped unchanged to the worker. Every on-disk location the
//! launcher touches is derived from the data directory here.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const MAINNET_NETWORK_ID: u64 = 1;
pub const ROPSTEN_NETWORK_ID: u64 = 3;

/// Network ids the launcher knows how to start.
pub const PRECONFIGURED_NETWORKS: [u64; 2] = [MAINNET_NETWORK_ID, ROPSTEN_NETWORK_ID];

/// A preconfigured network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Ropsten,
}

impl Network {
    pub fn from_id(network_id: u64) -> Option<Self> {
        match network_id {
            MAINNET_NETWORK_ID => Some(Network::Mainnet),
            ROPSTEN_NETWORK_ID => Some(Network::Ropsten),
            _ => None,
        }
    }

    pub fn id(self) -> u64 {
        match self {
            Network::Mainnet => MAINNET_NETWORK_ID,
            Network::Ropsten => ROPSTEN_NETWORK_ID,
        }
    }

    /// Directory name used for this network's default data directory.
    pub fn name(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Ropsten => "ropsten",
        }
    }
}

/// Storage engine backing the chain database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[value(name = "leveldb")]
    LevelDb,
    #[value(name = "rocksdb")]
    RocksDb,
}

impl fmt::Display for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbEngine::LevelDb => f.write_str("leveldb"),
            DbEngine::RocksDb => f.write_str("rocksdb"),
        }
    }
}

/// Contents of the engine marker kept next to the chain database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMarker {
    pub engine: DbEngine,
}

/// Root configuration for a node launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: Network,

    /// Resolved data directory.
    pub data_dir: PathBuf,

    /// Configured storage engine.
    pub db_engine: DbEngine,
}

impl NodeConfig {
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn logfile_path(&self) -> PathBuf {
        self.logs_dir().join("skein.log")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    /// Socket the event broker binds.
    pub fn broker_endpoint(&self) -> PathBuf {
        self.ipc_dir().join("broker.sock")
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.data_dir.join("pids")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join("chain")
    }

    pub fn engine_marker_path(&self) -> PathBuf {
        self.database_dir().join("engine.toml")
    }

    /// Subdirectories created when the data directory is initialized.
    pub fn required_dirs(&self) -> [PathBuf; 4] {
        [
            self.logs_dir(),
            self.ipc_dir(),
            self.pid_dir(),
            self.database_dir(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_ids() {
        for id in PRECONFIGURED_NETWORKS {
            assert_eq!(Network::from_id(id).map(Network::id), Some(id));
        }
        assert_eq!(Network::from_id(42), None);
    }

    #[test]
    fn test_paths_hang_off_data_dir() {
        let config = NodeConfig {
            network: Network::Ropsten,
            data_dir: PathBuf::from("/srv/skein/ropsten"),
            db_engine: DbEngine::RocksDb,
        };
        assert_eq!(
            config.broker_endpoint(),
            PathBuf::from("/srv/skein/ropsten/ipc/broker.sock")
        );
        assert_eq!(
            config.engine_marker_path(),
            PathBuf::from("/srv/skein/ropsten/chain/engine.toml")
        );
    }

    #[test]
    fn test_engine_marker_toml() {
        let marker: EngineMarker = toml::from_str("engine = \"rocksdb\"").unwrap();
        assert_eq!(marker.engine, DbEngine::RocksDb);
    }
}
