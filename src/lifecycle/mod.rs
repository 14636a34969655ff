//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Main process (startup.rs):
//!     Broker + main channel → plugins → validate config → start broker
//!     → spawn worker (process.rs) → subscribe shutdown → prepare plugins
//!     → wait for latch / signal / fault / worker exit
//!
//! Worker process (worker.rs):
//!     Pid file → service → connect channel → prepare plugins
//!     → service ∥ exit watcher → plugins down → channel stopped
//!
//! Shutdown (shutdown.rs):
//!     Latch fires once → plugins → channels → broker
//!     → join worker (2s) → terminate if still alive
//! ```
//!
//! # Design Decisions
//! - Ordered startup: nothing is spawned until configuration is valid
//! - Ordered shutdown: plugins before channels, channels before broker
//! - Shutdown has a deadline for the worker: forced termination afterwards

pub mod launch;
pub mod pidfile;
pub mod process;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod worker;

pub use shutdown::{ShutdownLatch, ShutdownReport};
pub use startup::{MainSupervisor, RunningSupervisor};
