//! Startup orchestration for the main process.
//!
//! # Responsibilities
//! - Create the broker and the main channel, register plugins
//! - Validate configuration and prepare the data directory
//! - Start the broker, spawn the networking process, wire the shutdown trigger
//! - Run until a shutdown source fires, then run the shutdown protocol once
//!
//! # Design Decisions
//! - Fail fast: configuration errors abort before the broker starts
//! - Steps run in order; each is a precondition for the next
//! - Once the worker is spawned, every failure path goes through shutdown

use clap::CommandFactory;
use std::ffi::OsString;

use crate::config::cli::{parse_with, Cli, LaunchArgs, PluginCommand};
use crate::config::loader::{is_data_dir_initialized, initialize_data_dir, load_config, skein_root};
use crate::config::validation::{validate_engine, validate_logging};
use crate::config::ConfigError;
use crate::error::LaunchError;
use crate::ipc::{Broker, Channel, Event, EventKind, MAIN_CHANNEL, NETWORKING_CHANNEL};
use crate::lifecycle::launch::{LaunchExtras, LaunchPlan, LogQueue, WorkerLaunch};
use crate::lifecycle::pidfile::ProcessIdFile;
use crate::lifecycle::process::{Worker, WorkerSpawner};
use crate::lifecycle::shutdown::{MainShutdown, ShutdownLatch, ShutdownReport, INTERRUPT_REASON};
use crate::lifecycle::signals;
use crate::observability::logging::LoggingPlan;
use crate::plugins::{Plugin, PluginContext, PluginHost, PluginScope};

/// Reason recorded when the networking process exits on its own.
pub const WORKER_EXITED_REASON: &str = "networking process exited";

/// Name of the pid file the main process holds while it owns the data directory.
pub const MAIN_PID_NAME: &str = "main";

const BANNER: &str = r"
      _        _
  ___| | _____(_)_ __
 / __| |/ / _ \ | '_ \
 \__ \   <  __/ | | | |
 |___/_|\_\___|_|_| |_|
";

/// `skein/v<version>/<os>/rustc`
pub fn client_identifier() -> String {
    format!(
        "skein/v{}/{}/rustc",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

pub fn display_launch_logs(plan: &LaunchPlan) {
    for line in BANNER.lines().filter(|line| !line.trim().is_empty()) {
        tracing::info!("{}", line);
    }
    tracing::info!("skein {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(client = %client_identifier(), "Client identifier");
    tracing::info!(
        network = plan.config.network.name(),
        network_id = plan.config.network.id(),
        data_dir = %plan.config.data_dir.display(),
        engine = %plan.config.db_engine,
        "Launching node"
    );
    tracing::info!(logfile = %plan.logging.logfile.display(), "Debug log file");
}

/// Validate arguments and prepare the data directory.
///
/// Every error here is fatal and happens before anything is spawned.
pub fn prepare_launch(
    args: LaunchArgs,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<LaunchPlan, ConfigError> {
    validate_logging(&args)?;
    let config = load_config(&args, env)?;

    if !is_data_dir_initialized(&config) {
        let root = skein_root(env);
        initialize_data_dir(&config, root.as_deref())?;
    }
    validate_engine(&config)?;

    let logging = LoggingPlan::from_args(&args, config.logfile_path())?;
    let extras = LaunchExtras {
        log_queue: LogQueue::ParentStderr,
        log_level: logging.min_level().severity(),
        profile: args.profile,
    };

    Ok(LaunchPlan {
        args,
        config,
        logging,
        extras,
    })
}

/// The main process before the networking process exists.
pub struct MainSupervisor {
    broker: Broker,
    main_channel: Channel,
    host: PluginHost,
}

impl MainSupervisor {
    /// Create the broker and main channel, then register `plugins`.
    pub async fn new(plugins: Vec<Box<dyn Plugin>>) -> Result<Self, LaunchError> {
        let broker = Broker::new();
        let main_channel = broker.create_channel(MAIN_CHANNEL);
        main_channel.connect().await?;

        let mut host = PluginHost::new(PluginScope::MainAndIsolated);
        host.register(plugins)?;

        Ok(Self {
            broker,
            main_channel,
            host,
        })
    }

    /// The command line, extended by every registered plugin.
    pub fn command(&self) -> clap::Command {
        self.host.extend_cli(Cli::command())
    }

    pub fn parse_cli<I, T>(&self, argv: I) -> Result<Cli, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        parse_with(self.command(), argv)
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn main_channel(&self) -> &Channel {
        &self.main_channel
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Give up before booting. The broker is never started.
    pub async fn abort(self) {
        self.main_channel.stop();
        self.broker.stop().await;
    }

    /// Run a plugin subcommand instead of booting. The broker is never started.
    pub async fn run_command(
        mut self,
        command: &PluginCommand,
        plan: &LaunchPlan,
    ) -> Result<(), LaunchError> {
        let result = self.host.run_command(command, &plan.args, &plan.config);
        self.abort().await;
        Ok(result?)
    }

    /// Start the broker, spawn the networking process and prepare plugins.
    pub async fn boot(
        self,
        plan: LaunchPlan,
        spawner: &mut dyn WorkerSpawner,
    ) -> Result<RunningSupervisor, LaunchError> {
        let MainSupervisor {
            broker,
            main_channel,
            mut host,
        } = self;

        let networking_channel = broker.create_channel(NETWORKING_CHANNEL);
        let channels = [main_channel.clone(), networking_channel.clone()];

        let started = ProcessIdFile::acquire(&plan.config.pid_dir(), MAIN_PID_NAME)
            .map_err(LaunchError::from)
            .and_then(|pidfile| {
                start_and_spawn(&broker, &networking_channel, &plan, spawner)
                    .map(|worker| (pidfile, worker))
            });
        let (pidfile, spawned) = match started {
            Ok(started) => started,
            Err(e) => {
                MainShutdown::new(&mut host, &channels, &broker)
                    .run(Some(format!("boot failed: {}", e)))
                    .await;
                return Err(e);
            }
        };

        let mut running = RunningSupervisor {
            broker,
            main_channel,
            networking_channel,
            host,
            worker: spawned,
            latch: ShutdownLatch::new(),
            plan,
            report: None,
            _pidfile: pidfile,
        };

        if let Err(e) = running.wire_shutdown_and_prepare() {
            tracing::error!(error = %e, "Boot failed after the networking process started");
            running.shutdown(Some(format!("boot failed: {}", e))).await;
            return Err(e);
        }
        Ok(running)
    }
}

fn start_and_spawn(
    broker: &Broker,
    networking_channel: &Channel,
    plan: &LaunchPlan,
    spawner: &mut dyn WorkerSpawner,
) -> Result<Worker, LaunchError> {
    broker.start(plan.config.broker_endpoint())?;

    let launch = WorkerLaunch {
        args: plan.args.clone(),
        config: plan.config.clone(),
        channel: networking_channel.identity()?,
        extras: plan.extras.clone(),
    };
    Ok(spawner.spawn(&launch)?)
}

/// The main process while the networking process runs.
pub struct RunningSupervisor {
    broker: Broker,
    main_channel: Channel,
    networking_channel: Channel,
    host: PluginHost,
    worker: Worker,
    latch: ShutdownLatch,
    plan: LaunchPlan,
    report: Option<ShutdownReport>,
    _pidfile: ProcessIdFile,
}

impl std::fmt::Debug for RunningSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSupervisor")
            .field("plan", &self.plan)
            .field("report", &self.report)
            .field("_pidfile", &self._pidfile)
            .finish_non_exhaustive()
    }
}

impl RunningSupervisor {
    fn wire_shutdown_and_prepare(&mut self) -> Result<(), LaunchError> {
        let latch = self.latch.clone();
        self.main_channel
            .subscribe(EventKind::ShutdownRequest, move |event| {
                if let Event::ShutdownRequest { reason } = event {
                    if !latch.trigger(reason.clone()) {
                        tracing::debug!("Shutdown already in progress");
                    }
                }
                Ok(())
            })?;

        let ctx = PluginContext {
            args: &self.plan.args,
            config: &self.plan.config,
            extras: Some(&self.plan.extras),
            channel: &self.main_channel,
            scope: self.host.scope(),
        };
        self.host.prepare(&ctx)?;
        Ok(())
    }

    pub fn latch(&self) -> &ShutdownLatch {
        &self.latch
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn main_channel(&self) -> &Channel {
        &self.main_channel
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    pub fn worker_pid(&self) -> u32 {
        self.worker.pid()
    }

    /// Wait for a shutdown source, then shut everything down.
    pub async fn run(mut self) -> ShutdownReport {
        tracing::info!(pid = self.worker.pid(), "Node running");
        let mut worker_exited = false;
        let (reason, mut failure) = tokio::select! {
            reason = self.latch.wait() => (reason, None),
            signal = signals::shutdown_signal_or_pending() => {
                tracing::info!(signal, "Interrupt received");
                (Some(INTERRUPT_REASON.to_string()), None)
            }
            fault = self.main_channel.failed() => {
                let failure = fault.to_string();
                (Some(format!("subscriber failure: {}", failure)), Some(failure))
            }
            _ = self.worker.wait() => {
                worker_exited = true;
                (Some(WORKER_EXITED_REASON.to_string()), None)
            }
        };
        if worker_exited {
            failure = self.worker.exit_failure();
            if let Some(failure) = &failure {
                tracing::error!(failure = %failure, "Networking process failed");
            }
        }

        // Sources other than the event still go through the latch, and the
        // networking process is told through the bus.
        let failure = if self.latch.trigger(reason.clone()) {
            if let Err(e) = self.main_channel.publish(Event::ShutdownRequest {
                reason: reason.clone(),
            }) {
                tracing::warn!(error = %e, "Shutdown request not published");
            }
            failure
        } else {
            None
        };

        let mut report = self.shutdown(self.latch.reason()).await;
        report.failure = failure;
        report
    }

    /// Run the shutdown protocol. Later calls return the first report.
    pub async fn shutdown(&mut self, reason: Option<String>) -> ShutdownReport {
        if let Some(report) = &self.report {
            tracing::debug!("Shutdown already completed");
            return report.clone();
        }
        self.latch.trigger(reason);

        let channels = [self.main_channel.clone(), self.networking_channel.clone()];
        let report = MainShutdown::new(&mut self.host, &channels, &self.broker)
            .with_worker(&mut self.worker)
            .run(self.latch.reason())
            .await;
        self.report = Some(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_with_root(root: &std::path::Path) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<&str, String> = [("XDG_SKEIN_ROOT", root.display().to_string())]
            .into_iter()
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_client_identifier() {
        let id = client_identifier();
        assert!(id.starts_with("skein/v"));
        assert!(id.ends_with("/rustc"));
    }

    #[test]
    fn test_prepare_initializes_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = prepare_launch(LaunchArgs::default(), &env_with_root(tmp.path())).unwrap();

        assert_eq!(plan.config.data_dir, tmp.path().join("mainnet"));
        assert!(is_data_dir_initialized(&plan.config));
        assert_eq!(plan.extras.log_queue, LogQueue::ParentStderr);
    }

    #[test]
    fn test_extras_carry_min_level() {
        let tmp = tempfile::tempdir().unwrap();
        let args = LaunchArgs {
            stderr_log_level: Some("error".parse().unwrap()),
            file_log_level: Some("warn".parse().unwrap()),
            log_levels: vec!["skein::ipc=trace".parse().unwrap()],
            profile: true,
            ..LaunchArgs::default()
        };
        let plan = prepare_launch(args, &env_with_root(tmp.path())).unwrap();
        assert_eq!(plan.extras.log_level, 5);
        assert!(plan.extras.profile);
    }

    #[test]
    fn test_unsupported_network_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let args = LaunchArgs {
            network_id: 42,
            ..LaunchArgs::default()
        };
        let err = prepare_launch(args, &env_with_root(tmp.path())).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedNetwork(42)));
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }
}
