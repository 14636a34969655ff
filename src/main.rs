//! skein node launcher.
//!
//! # Architecture Overview
//!
//! ```text
//!   skein (main process)                       skein worker (networking process)
//!  ┌──────────────────────────────┐           ┌──────────────────────────────┐
//!  │ MainSupervisor               │   spawn   │ launch_node                  │
//!  │  ├─ Broker ◀─── unix socket ─┼───────────┼─▶ Channel "networking"       │
//!  │  ├─ Channel "main"           │           │  ├─ PluginHost (shared)      │
//!  │  ├─ PluginHost (main)        │  stderr   │  └─ NetworkingService        │
//!  │  └─ LogListener ◀────────────┼───────────┼── JSON log records           │
//!  └──────────────────────────────┘           └──────────────────────────────┘
//! ```
//!
//! Both processes run a single-threaded Tokio runtime.

use clap::Parser;
use std::ffi::OsString;
use std::process::ExitCode;

use skein::config::cli::{Cli, CliCommand};
use skein::config::loader::process_env;
use skein::lifecycle::launch::WorkerLaunch;
use skein::lifecycle::process::ExecSpawner;
use skein::lifecycle::startup::{display_launch_logs, prepare_launch};
use skein::lifecycle::worker::worker_entry;
use skein::lifecycle::MainSupervisor;
use skein::observability::logging::init_main_logging;
use skein::plugins::registry;
use skein::LaunchError;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start the runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let argv: Vec<OsString> = std::env::args_os().collect();
    let is_worker = matches!(
        Cli::try_parse_from(&argv),
        Ok(Cli {
            command: Some(CliCommand::Worker),
            ..
        })
    );

    if is_worker {
        run_worker(&runtime)
    } else {
        runtime.block_on(run_main(argv))
    }
}

fn run_worker(runtime: &tokio::runtime::Runtime) -> ExitCode {
    let launch = match WorkerLaunch::read_from(std::io::stdin().lock()) {
        Ok(launch) => launch,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let entry = worker_entry();
    match runtime.block_on(entry(launch)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Networking process failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_main(argv: Vec<OsString>) -> ExitCode {
    let supervisor = match MainSupervisor::new(registry::enabled_plugins()).await {
        Ok(supervisor) => supervisor,
        Err(e) => return fail(&e),
    };

    let cli = match supervisor.parse_cli(argv) {
        Ok(cli) => cli,
        Err(e) => {
            supervisor.abort().await;
            let _ = e.print();
            return ExitCode::from(e.exit_code().clamp(0, 255) as u8);
        }
    };

    let plugin_command = cli.plugin_command;
    let plan = match prepare_launch(cli.launch, &process_env) {
        Ok(plan) => plan,
        Err(e) => {
            supervisor.abort().await;
            return fail(&e.into());
        }
    };

    if let Err(e) = init_main_logging(&plan.logging) {
        supervisor.abort().await;
        return fail(&e.into());
    }
    display_launch_logs(&plan);

    if let Some(command) = plugin_command {
        return match supervisor.run_command(&command, &plan).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fail(&e),
        };
    }

    let mut spawner = match ExecSpawner::current_exe() {
        Ok(spawner) => spawner,
        Err(e) => {
            supervisor.abort().await;
            return fail(&e.into());
        }
    };

    let running = match supervisor.boot(plan, &mut spawner).await {
        Ok(running) => running,
        Err(e) => return fail(&e),
    };

    let report = running.run().await;
    eprintln!("{}", report.exit_message());
    match report.failure {
        Some(_) => ExitCode::FAILURE,
        None => ExitCode::SUCCESS,
    }
}

fn fail(error: &LaunchError) -> ExitCode {
    tracing::error!(error = %error, "Launch failed");
    eprintln!("Error: {}", error);
    if error.is_usage_error() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}
