//! Entry point of the networking process.
//!
//! # Data Flow
//! ```text
//! stdin (WorkerLaunch JSON)
//!     → with_profiling(with_queued_logging(launch_node))
//!     → pid file → service → channel.connect → plugin host.prepare
//!     → run_worker: service.run ∥ exit watcher
//!     → exit watcher: host.shutdown → channel.stop
//! ```
//!
//! The exit watcher fires on whichever comes first: the service finishing,
//! a shutdown request on the worker channel, an OS signal, or a channel
//! fault (including the broker going away).

use crate::config::schema::NodeConfig;
use crate::error::LaunchError;
use crate::ipc::{Channel, Event, EventKind};
use crate::lifecycle::launch::{EntryFuture, WorkerLaunch};
use crate::lifecycle::pidfile::ProcessIdFile;
use crate::lifecycle::shutdown::ShutdownLatch;
use crate::lifecycle::signals;
use crate::node::{build_service, Service, ServiceError};
use crate::observability::logging::with_queued_logging;
use crate::observability::profiling::with_profiling;
use crate::plugins::{registry, Plugin, PluginContext, PluginHost, PluginScope};

/// Name of the pid file guarding the data directory.
pub const WORKER_PID_NAME: &str = "networking";

/// The worker entry with logging configured and optional profiling around it.
pub fn worker_entry() -> impl FnOnce(WorkerLaunch) -> EntryFuture {
    with_profiling(
        "launch_node",
        with_queued_logging(|launch| -> EntryFuture { Box::pin(launch_node(launch)) }),
    )
}

/// Boot the networking process with the built-in plugins and node service.
pub async fn launch_node(launch: WorkerLaunch) -> Result<(), LaunchError> {
    launch_node_with(launch, registry::enabled_plugins(), build_service).await
}

/// Boot the networking process around the service `build` returns.
pub async fn launch_node_with<B>(
    launch: WorkerLaunch,
    plugins: Vec<Box<dyn Plugin>>,
    build: B,
) -> Result<(), LaunchError>
where
    B: FnOnce(&NodeConfig) -> Result<Box<dyn Service>, ServiceError>,
{
    let pidfile = ProcessIdFile::acquire(&launch.config.pid_dir(), WORKER_PID_NAME)?;
    let service = build(&launch.config)?;

    let channel = Channel::attach(launch.channel.clone());
    channel.connect().await?;

    let mut host = PluginHost::new(PluginScope::Shared);
    let prepared = host.register(plugins).and_then(|()| {
        host.prepare(&PluginContext {
            args: &launch.args,
            config: &launch.config,
            extras: Some(&launch.extras),
            channel: &channel,
            scope: PluginScope::Shared,
        })
    });
    if let Err(e) = prepared {
        tracing::error!(error = %e, "Plugins failed to start");
        host.shutdown().await;
        channel.stop();
        return Err(e.into());
    }

    let result = run_worker(service, host, channel).await;
    drop(pidfile);
    result
}

/// Run `service` next to the exit watcher until both are done.
pub async fn run_worker(
    mut service: Box<dyn Service>,
    mut host: PluginHost,
    channel: Channel,
) -> Result<(), LaunchError> {
    let cancel = ShutdownLatch::new();
    let finished = ShutdownLatch::new();

    let subscription = channel.subscribe(EventKind::ShutdownRequest, {
        let cancel = cancel.clone();
        move |event| {
            if let Event::ShutdownRequest { reason } = event {
                cancel.trigger(reason.clone());
            }
            Ok(())
        }
    })?;

    let service_name = service.name().to_string();
    let run = async {
        let result = service.run(cancel.clone()).await;
        let outcome = match &result {
            Ok(()) => format!("{} service finished", service_name),
            Err(e) => format!("{} service failed: {}", service_name, e),
        };
        finished.trigger(Some(outcome));
        result
    };

    let watch = async {
        let reason = tokio::select! {
            reason = finished.wait() => reason,
            reason = cancel.wait() => reason,
            signal = signals::shutdown_signal_or_pending() => Some(format!("received {}", signal)),
            fault = channel.failed() => Some(format!("channel failure: {}", fault)),
        };
        cancel.trigger(reason.clone());

        tracing::info!(
            reason = reason.as_deref().unwrap_or("unspecified"),
            "Networking process shutting down"
        );
        host.shutdown().await;
        channel.unsubscribe(subscription);
        channel.stop();
    };

    let (result, ()) = tokio::join!(run, watch);
    result?;
    tracing::info!("Networking process stopped");
    Ok(())
}
