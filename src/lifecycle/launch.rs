//! Values handed from the main process to the worker.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;

use crate::config::cli::LaunchArgs;
use crate::config::schema::NodeConfig;
use crate::error::LaunchError;
use crate::ipc::ChannelIdentity;
use crate::observability::logging::LoggingPlan;

/// Future returned by a worker entry routine and its wrappers.
pub type EntryFuture = Pin<Box<dyn Future<Output = Result<(), LaunchError>>>>;

/// Where the worker sends its log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogQueue {
    /// JSON records on stderr, drained by the parent's log listener.
    ParentStderr,
    /// Plain records on stderr, nobody listening.
    Disabled,
}

/// Extras passed alongside the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchExtras {
    pub log_queue: LogQueue,
    /// Minimum severity across every configured sink.
    pub log_level: u8,
    pub profile: bool,
}

/// Everything the worker entry needs, written to its stdin as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLaunch {
    pub args: LaunchArgs,
    pub config: NodeConfig,
    pub channel: ChannelIdentity,
    pub extras: LaunchExtras,
}

impl WorkerLaunch {
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, LaunchError> {
        serde_json::from_reader(reader).map_err(|e| LaunchError::Payload(e.to_string()))
    }
}

/// Validated inputs for booting the main process.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub args: LaunchArgs,
    pub config: NodeConfig,
    pub logging: LoggingPlan,
    pub extras: LaunchExtras,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{DbEngine, Network};
    use std::path::PathBuf;

    #[test]
    fn test_payload_over_a_pipe() {
        let launch = WorkerLaunch {
            args: LaunchArgs::default(),
            config: NodeConfig {
                network: Network::Mainnet,
                data_dir: PathBuf::from("/tmp/skein"),
                db_engine: DbEngine::LevelDb,
            },
            channel: ChannelIdentity {
                name: "networking".into(),
                endpoint: PathBuf::from("/tmp/skein/ipc/broker.sock"),
            },
            extras: LaunchExtras {
                log_queue: LogQueue::ParentStderr,
                log_level: 10,
                profile: true,
            },
        };

        let mut buffer = Vec::new();
        launch.write_to(&mut buffer).unwrap();
        let decoded = WorkerLaunch::read_from(buffer.as_slice()).unwrap();
        assert_eq!(decoded, launch);
    }

    #[test]
    fn test_truncated_payload() {
        let err = WorkerLaunch::read_from(&b"{\"args\":"[..]).unwrap_err();
        assert!(matches!(err, LaunchError::Payload(_)));
    }
}
