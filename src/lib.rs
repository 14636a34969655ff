//! skein: node launcher and supervisor.
//!
//! Runs a main control process and a networking process, connected by an
//! event bus, and shuts both down in order.

pub mod config;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod node;
pub mod observability;
pub mod plugins;

pub use config::NodeConfig;
pub use error::LaunchError;
pub use ipc::{Broker, Channel, Event, EventKind};
pub use lifecycle::{MainSupervisor, ShutdownLatch, ShutdownReport};
