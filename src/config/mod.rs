//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! argv (core flags + plugin flags)
//!     → cli.rs (parse into LaunchArgs)
//!     → validation.rs (network, logging)
//!     → loader.rs (resolve data dir, initialize if needed)
//!     → validation.rs (engine marker check)
//!     → NodeConfig (immutable, shipped to the worker)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once resolved; both processes see the same value
//! - Environment lookups go through a closure so resolution is testable
//! - Every failure here is a usage error, reported before anything starts

pub mod cli;
pub mod loader;
pub mod schema;
pub mod validation;

pub use cli::{Cli, CliCommand, LaunchArgs};
pub use loader::ConfigError;
pub use schema::{DbEngine, Network, NodeConfig};
