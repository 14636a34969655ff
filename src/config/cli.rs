//! Command-line surface.
//!
//! The core flags are declared with the clap derive API; plugins extend
//! the resulting `clap::Command` before it is parsed. Values of
//! plugin-contributed flags are kept as raw strings in
//! [`LaunchArgs::plugin_args`] so they survive the trip to the worker.
//! A plugin-contributed subcommand ends up in [`Cli::plugin_command`].

use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::schema::{DbEngine, MAINNET_NETWORK_ID};
use crate::observability::logging::{LogLevel, LogLevelDirective};

/// Name of the hidden subcommand the main process uses to start the worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

#[derive(Debug, Parser)]
#[command(name = "skein", version, about = "Launch and supervise a skein node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Subcommand contributed by a plugin, if one was invoked.
    #[arg(skip)]
    pub plugin_command: Option<PluginCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Run the networking process (started by the main process).
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker,
}

/// Parsed launch arguments shared by both processes.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
pub struct LaunchArgs {
    /// Network to join (1 = mainnet, 3 = ropsten).
    #[arg(long, default_value_t = MAINNET_NETWORK_ID)]
    pub network_id: u64,

    /// Data directory; defaults to a per-network directory under the skein root.
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Storage engine for the chain database.
    #[arg(long, value_enum, default_value_t = DbEngine::LevelDb)]
    pub db_engine: DbEngine,

    /// Level for stderr output.
    #[arg(long, value_name = "LEVEL")]
    pub stderr_log_level: Option<LogLevel>,

    /// Level for the log file.
    #[arg(long, value_name = "LEVEL")]
    pub file_log_level: Option<LogLevel>,

    /// Default level (`LEVEL`) or a per-logger level (`LOGGER=LEVEL`); repeatable.
    #[arg(short = 'l', long = "log-level", value_name = "[LOGGER=]LEVEL")]
    pub log_levels: Vec<LogLevelDirective>,

    /// Time the networking process and log its run time.
    #[arg(long)]
    pub profile: bool,

    /// Raw values of flags contributed by plugins, by argument id.
    #[arg(skip)]
    pub plugin_args: BTreeMap<String, Vec<String>>,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self {
            network_id: MAINNET_NETWORK_ID,
            data_dir: None,
            db_engine: DbEngine::LevelDb,
            stderr_log_level: None,
            file_log_level: None,
            log_levels: Vec::new(),
            profile: false,
            plugin_args: BTreeMap::new(),
        }
    }
}

impl LaunchArgs {
    /// First raw value of a plugin-contributed argument.
    pub fn plugin_arg(&self, id: &str) -> Option<&str> {
        self.plugin_args
            .get(id)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Whether a plugin-contributed boolean flag was set.
    pub fn plugin_flag(&self, id: &str) -> bool {
        self.plugin_arg(id) == Some("true")
    }
}

/// A plugin subcommand and the raw values of its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginCommand {
    pub name: String,
    pub args: BTreeMap<String, Vec<String>>,
}

impl PluginCommand {
    pub fn arg(&self, id: &str) -> Option<&str> {
        self.args
            .get(id)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn flag(&self, id: &str) -> bool {
        self.arg(id) == Some("true")
    }
}

/// Parse `argv` against `command`, which is the core CLI possibly extended by plugins.
pub fn parse_with<I, T>(command: clap::Command, argv: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let core: HashSet<String> = Cli::command()
        .get_arguments()
        .map(|arg| arg.get_id().to_string())
        .collect();
    let contributed: Vec<String> = command
        .get_arguments()
        .map(|arg| arg.get_id().to_string())
        .filter(|id| !core.contains(id))
        .collect();

    let matches = command.try_get_matches_from(argv)?;
    let mut cli = Cli::from_arg_matches(&matches)?;

    for id in contributed {
        if let Some(raw) = matches.get_raw(&id) {
            let values = raw.map(|v| v.to_string_lossy().into_owned()).collect();
            cli.launch.plugin_args.insert(id, values);
        }
    }

    if let Some((name, sub)) = matches.subcommand() {
        if !CliCommand::has_subcommand(name) {
            let args = sub
                .ids()
                .filter_map(|id| {
                    let raw = sub.get_raw(id.as_str())?;
                    let values = raw.map(|v| v.to_string_lossy().into_owned()).collect();
                    Some((id.to_string(), values))
                })
                .collect();
            cli.plugin_command = Some(PluginCommand {
                name: name.to_string(),
                args,
            });
        }
    }
    Ok(cli)
}
