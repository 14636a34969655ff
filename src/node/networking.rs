//! Networking service placeholder.
//!
//! Stands in for the peer-to-peer engine: it validates the on-disk layout
//! it was given, announces itself and idles until cancelled.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::schema::{Network, NodeConfig};
use crate::lifecycle::shutdown::ShutdownLatch;
use crate::node::{Service, ServiceError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct NetworkingService {
    network: Network,
    database_dir: PathBuf,
    heartbeat: Duration,
}

impl NetworkingService {
    pub fn new(config: &NodeConfig) -> Result<Self, ServiceError> {
        let database_dir = config.database_dir();
        if !database_dir.is_dir() {
            return Err(ServiceError::MissingDatabase(database_dir));
        }
        Ok(Self {
            network: config.network,
            database_dir,
            heartbeat: HEARTBEAT_INTERVAL,
        })
    }
}

#[async_trait]
impl Service for NetworkingService {
    fn name(&self) -> &str {
        "networking"
    }

    async fn run(&mut self, cancel: ShutdownLatch) -> Result<(), ServiceError> {
        tracing::info!(
            network = self.network.name(),
            network_id = self.network.id(),
            database = %self.database_dir.display(),
            "Networking service running"
        );

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                reason = cancel.wait() => {
                    tracing::info!(reason = reason.as_deref().unwrap_or("unspecified"), "Networking service stopping");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    tracing::debug!(network = self.network.name(), "Networking service alive");
                }
            }
        }
    }
}
