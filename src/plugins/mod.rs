//! Plugin subsystem.
//!
//! # Data Flow
//! ```text
//! registry::enabled_plugins()
//!     → PluginHost::register (both processes, same set)
//!     → PluginHost::extend_cli (main process, before parsing)
//!     → PluginHost::run_command (main process, when a plugin subcommand was given)
//!     → PluginHost::prepare (scope decides which plugins start here)
//!     → PluginHost::shutdown / shutdown_blocking (reverse start order)
//! ```
//!
//! # Design Decisions
//! - Scope is a closed enum; each process owns exactly one host
//! - A plugin activates only in the process whose host scope matches its own
//! - Plugins see the process's channel through `PluginContext`, never a global
//! - A plugin subcommand replaces the boot: nothing is spawned and no plugin starts

pub mod cleanup;
pub mod host;
pub mod registry;
pub mod uptime;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::cli::{LaunchArgs, PluginCommand};
use crate::config::schema::NodeConfig;
use crate::ipc::Channel;
use crate::lifecycle::launch::LaunchExtras;

pub use host::{HostState, PluginHost};

/// Which process a plugin runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginScope {
    /// The main process; such plugins may spawn their own subprocesses.
    MainAndIsolated,
    /// The networking process, next to the node.
    Shared,
}

impl PluginScope {
    pub fn allows_subprocesses(self) -> bool {
        matches!(self, PluginScope::MainAndIsolated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginScope::MainAndIsolated => "main-and-isolated",
            PluginScope::Shared => "shared",
        }
    }
}

impl fmt::Display for PluginScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin host is {state}: cannot {operation}")]
    Lifecycle {
        state: HostState,
        operation: &'static str,
    },

    #[error("plugin '{plugin}' failed to start: {message}")]
    Start { plugin: String, message: String },

    #[error("no plugin provides the '{0}' command")]
    UnknownCommand(String),

    #[error("{plugin}: {message}")]
    Command { plugin: String, message: String },
}

/// What a plugin sees when it is started.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    pub args: &'a LaunchArgs,
    pub config: &'a NodeConfig,
    /// Present in the worker, where the launch extras are known.
    pub extras: Option<&'a LaunchExtras>,
    pub channel: &'a Channel,
    pub scope: PluginScope,
}

/// A unit of optional functionality hosted next to the node.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn scope(&self) -> PluginScope;

    /// Add flags or subcommands to the command line before it is parsed.
    fn extend_cli(&self, command: clap::Command) -> clap::Command {
        command
    }

    /// Whether this plugin added the subcommand `name`.
    fn provides_command(&self, _name: &str) -> bool {
        false
    }

    /// Run a subcommand this plugin added. Called instead of booting the node,
    /// once the configuration is resolved.
    fn run_command(
        &mut self,
        command: &PluginCommand,
        _args: &LaunchArgs,
        _config: &NodeConfig,
    ) -> Result<(), PluginError> {
        Err(PluginError::UnknownCommand(command.name.clone()))
    }

    fn should_start(&self, _ctx: &PluginContext<'_>) -> bool {
        true
    }

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;

    fn stop(&mut self);
}
