//! The service hosted by the networking process.
//!
//! # Responsibilities
//! - Define the contract between the worker entry and the hosted node
//! - Build the service for a resolved configuration
//!
//! # Design Decisions
//! - The worker only knows `Service`; the protocol engine stays behind it
//! - Cancellation arrives as a `ShutdownLatch` so the service and the exit
//!   watcher share one stop signal

pub mod networking;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::schema::NodeConfig;
use crate::lifecycle::shutdown::ShutdownLatch;

pub use networking::NetworkingService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database directory {} is missing; was the data directory initialized?", .0.display())]
    MissingDatabase(PathBuf),

    #[error("service '{service}' failed: {message}")]
    Failed { service: String, message: String },
}

/// A long-running service owned by the worker process.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &str;

    /// Run until `cancel` fires or the service stops on its own.
    async fn run(&mut self, cancel: ShutdownLatch) -> Result<(), ServiceError>;
}

/// Build the node service for `config`.
pub fn build_service(config: &NodeConfig) -> Result<Box<dyn Service>, ServiceError> {
    Ok(Box::new(NetworkingService::new(config)?))
}
