//! Built-in `fix-unclean-shutdown` command.
//!
//! A node killed without running its shutdown leaves pid files and the
//! broker socket behind. The command removes them, after checking that
//! nothing still holds them.

use std::path::Path;

use crate::config::cli::{LaunchArgs, PluginCommand};
use crate::config::schema::NodeConfig;
use crate::ipc::clear_stale_endpoint;
use crate::lifecycle::pidfile::{PidFileError, ProcessIdFile};
use crate::plugins::{Plugin, PluginContext, PluginError, PluginScope};

pub const FIX_UNCLEAN_SHUTDOWN: &str = "fix-unclean-shutdown";

#[derive(Debug, Default)]
pub struct FixUncleanShutdown;

impl FixUncleanShutdown {
    pub fn new() -> Self {
        Self
    }

    fn failed(&self, message: impl Into<String>) -> PluginError {
        PluginError::Command {
            plugin: FIX_UNCLEAN_SHUTDOWN.to_string(),
            message: message.into(),
        }
    }

    fn remove_pid_files(&self, dir: &Path) -> Result<usize, PluginError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.failed(format!("cannot list {}: {}", dir.display(), e))),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("pid") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            // Taking the lock proves the owner is gone; dropping it removes the file.
            match ProcessIdFile::acquire(dir, name) {
                Ok(stale) => {
                    tracing::info!(path = %stale.path().display(), "Removed stale pid file");
                    removed += 1;
                }
                Err(PidFileError::AlreadyRunning { name, pid, .. }) => {
                    let owner = pid.map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {}", pid));
                    return Err(self.failed(format!(
                        "the {} process is still running ({}); stop it first",
                        name, owner
                    )));
                }
                Err(e) => return Err(self.failed(e.to_string())),
            }
        }
        Ok(removed)
    }
}

impl Plugin for FixUncleanShutdown {
    fn name(&self) -> &str {
        FIX_UNCLEAN_SHUTDOWN
    }

    fn scope(&self) -> PluginScope {
        PluginScope::MainAndIsolated
    }

    fn extend_cli(&self, command: clap::Command) -> clap::Command {
        command.subcommand(
            clap::Command::new(FIX_UNCLEAN_SHUTDOWN)
                .about("Remove pid files and the broker socket left behind by a crashed node"),
        )
    }

    fn provides_command(&self, name: &str) -> bool {
        name == FIX_UNCLEAN_SHUTDOWN
    }

    /// Only runs as a command.
    fn should_start(&self, _ctx: &PluginContext<'_>) -> bool {
        false
    }

    fn start(&mut self, _ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn run_command(
        &mut self,
        _command: &PluginCommand,
        _args: &LaunchArgs,
        config: &NodeConfig,
    ) -> Result<(), PluginError> {
        let pid_files = self.remove_pid_files(&config.pid_dir())?;

        let endpoint = config.broker_endpoint();
        let socket = clear_stale_endpoint(&endpoint).map_err(|e| self.failed(e.to_string()))?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            pid_files,
            socket,
            "Cleaned up after unclean shutdown"
        );
        Ok(())
    }
}
