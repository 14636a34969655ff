//! Cross-process event bus.
//!
//! # Data Flow
//! ```text
//! main process                                   worker process
//!   Channel("main") ──┐                      ┌── Channel("networking")
//!                     ▼                      │        (remote link)
//!               Broker router ◀── unix socket ┘
//!                     │
//!     routes each event to every other channel
//!     subscribed to its kind, in arrival order
//! ```
//!
//! # Design Decisions
//! - One router task owns the routing table; every local and remote
//!   command goes through its queue, so per-channel order is preserved
//! - Local handlers run synchronously inside `publish`; a failing handler
//!   is returned to the publisher, never swallowed
//! - Frames are newline-delimited JSON

pub mod broker;
pub mod channel;
pub mod event;
mod wire;

pub use broker::{clear_stale_endpoint, Broker, BrokerState};
pub use channel::{Channel, ChannelIdentity, ChannelState, SubscriptionId};
pub use event::{Event, EventKind};

use thiserror::Error;

/// Well-known channel owned by the main process.
pub const MAIN_CHANNEL: &str = "main";

/// Well-known channel owned by the networking worker.
pub const NETWORKING_CHANNEL: &str = "networking";

/// Error raised by a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from channel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("channel '{0}' is not connected")]
    NotConnected(String),

    #[error("event broker is not running")]
    NotRunning,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler for {kind} on channel '{channel}' failed: {source}")]
    Handler {
        channel: String,
        kind: EventKind,
        #[source]
        source: HandlerError,
    },
}

/// Errors from broker lifecycle operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("event broker already started")]
    AlreadyStarted,

    #[error("event broker has been stopped")]
    Stopped,

    #[error("another broker is listening on {}; is skein already running?", .path.display())]
    InUse { path: std::path::PathBuf },

    #[error("failed to bind broker endpoint {}: {source}", .path.display())]
    Bind {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
