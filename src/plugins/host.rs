//! Per-process plugin host.

use std::fmt;

use crate::config::cli::{LaunchArgs, PluginCommand};
use crate::config::schema::NodeConfig;
use crate::plugins::{Plugin, PluginContext, PluginError, PluginScope};

/// Lifecycle of a plugin host. Never goes backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Prepared,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Created => "created",
            HostState::Prepared => "prepared",
            HostState::ShuttingDown => "shutting down",
            HostState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Owns the registered plugins of one process.
pub struct PluginHost {
    scope: PluginScope,
    plugins: Vec<Box<dyn Plugin>>,
    /// Indices into `plugins`, in start order.
    active: Vec<usize>,
    state: HostState,
}

impl PluginHost {
    pub fn new(scope: PluginScope) -> Self {
        Self {
            scope,
            plugins: Vec::new(),
            active: Vec::new(),
            state: HostState::Created,
        }
    }

    pub fn scope(&self) -> PluginScope {
        self.scope
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn active_plugins(&self) -> Vec<&str> {
        self.active.iter().map(|&i| self.plugins[i].name()).collect()
    }

    /// Add plugins. Only allowed before `prepare`; duplicate names are skipped.
    pub fn register<I>(&mut self, plugins: I) -> Result<(), PluginError>
    where
        I: IntoIterator<Item = Box<dyn Plugin>>,
    {
        if self.state != HostState::Created {
            return Err(PluginError::Lifecycle {
                state: self.state,
                operation: "register plugins",
            });
        }

        for plugin in plugins {
            if self.plugins.iter().any(|p| p.name() == plugin.name()) {
                tracing::warn!(plugin = %plugin.name(), "Plugin already registered, ignoring duplicate");
                continue;
            }
            tracing::debug!(plugin = %plugin.name(), scope = %plugin.scope(), "Plugin registered");
            self.plugins.push(plugin);
        }
        Ok(())
    }

    /// Let every registered plugin add its flags.
    pub fn extend_cli(&self, command: clap::Command) -> clap::Command {
        self.plugins
            .iter()
            .fold(command, |command, plugin| plugin.extend_cli(command))
    }

    /// Hand a plugin subcommand to the plugin that added it.
    ///
    /// Runs regardless of scope and leaves the host unprepared.
    pub fn run_command(
        &mut self,
        command: &PluginCommand,
        args: &LaunchArgs,
        config: &NodeConfig,
    ) -> Result<(), PluginError> {
        if self.state != HostState::Created {
            return Err(PluginError::Lifecycle {
                state: self.state,
                operation: "run a plugin command",
            });
        }

        let plugin = self
            .plugins
            .iter_mut()
            .find(|plugin| plugin.provides_command(&command.name))
            .ok_or_else(|| PluginError::UnknownCommand(command.name.clone()))?;
        tracing::info!(plugin = %plugin.name(), command = %command.name, "Running plugin command");
        plugin.run_command(command, args, config)
    }

    /// Start every plugin eligible in this process.
    ///
    /// Plugins whose scope differs from the host's stay idle. If one fails
    /// to start, the ones already started stay active for `shutdown`.
    pub fn prepare(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        if self.state != HostState::Created {
            return Err(PluginError::Lifecycle {
                state: self.state,
                operation: "prepare",
            });
        }
        self.state = HostState::Prepared;

        let ctx = PluginContext {
            scope: self.scope,
            ..*ctx
        };

        for (index, plugin) in self.plugins.iter_mut().enumerate() {
            if plugin.scope() != self.scope {
                continue;
            }
            if !plugin.should_start(&ctx) {
                tracing::info!(plugin = %plugin.name(), "Plugin disabled");
                continue;
            }
            plugin.start(&ctx)?;
            self.active.push(index);
            tracing::info!(plugin = %plugin.name(), scope = %self.scope, "Plugin started");
        }

        tracing::debug!(
            scope = %self.scope,
            registered = self.plugins.len(),
            active = self.active.len(),
            "Plugin host prepared"
        );
        Ok(())
    }

    /// Stop every active plugin, synchronously. Idempotent.
    pub fn shutdown_blocking(&mut self) {
        if !self.begin_shutdown() {
            return;
        }
        while let Some(index) = self.active.pop() {
            self.stop_plugin(index);
        }
        self.finish_shutdown();
    }

    /// Stop every active plugin, yielding between plugins. Idempotent.
    pub async fn shutdown(&mut self) {
        if !self.begin_shutdown() {
            return;
        }
        while let Some(index) = self.active.pop() {
            self.stop_plugin(index);
            tokio::task::yield_now().await;
        }
        self.finish_shutdown();
    }

    fn begin_shutdown(&mut self) -> bool {
        match self.state {
            HostState::ShuttingDown | HostState::Stopped => false,
            HostState::Created | HostState::Prepared => {
                tracing::info!(scope = %self.scope, active = self.active.len(), "Stopping plugins");
                self.state = HostState::ShuttingDown;
                true
            }
        }
    }

    fn stop_plugin(&mut self, index: usize) {
        let plugin = &mut self.plugins[index];
        plugin.stop();
        tracing::debug!(plugin = %plugin.name(), "Plugin stopped");
    }

    fn finish_shutdown(&mut self) {
        self.state = HostState::Stopped;
        tracing::info!(scope = %self.scope, "Plugins stopped");
    }
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("plugins", &self.plugin_names())
            .field("active", &self.active_plugins())
            .finish()
    }
}
