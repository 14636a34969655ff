//! Shutdown coordination.
//!
//! # Responsibilities
//! - Guarantee the shutdown protocol runs at most once per process
//! - Sequence the main-process teardown: plugins, channels, broker, worker
//! - Bound the wait for the worker and escalate to forceful termination
//!
//! # Design Decisions
//! - The latch is the only trigger path; events and signals both go through it
//! - Plugin shutdown always completes before any channel is stopped
//! - The grace-period wait is a non-blocking poll on the event loop

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::ipc::{Broker, Channel};
use crate::lifecycle::process::Worker;
use crate::plugins::PluginHost;

/// Time the worker gets to exit on its own before it is terminated.
pub const WORKER_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Reason recorded when the main process is interrupted by a signal.
pub const INTERRUPT_REASON: &str = "CTRL+C / Keyboard Interrupt";

/// Shown when a shutdown request carries no reason.
const UNSPECIFIED_REASON: &str = "unspecified";

/// Once-only shutdown trigger shared by every shutdown source.
#[derive(Clone)]
pub struct ShutdownLatch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    reason: OnceLock<Option<String>>,
    fired: watch::Sender<bool>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            inner: Arc::new(LatchInner {
                reason: OnceLock::new(),
                fired,
            }),
        }
    }

    /// Record `reason` and release waiters. Only the first call wins.
    pub fn trigger(&self, reason: Option<String>) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        self.inner.fired.send_replace(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.get().cloned().flatten()
    }

    /// Resolve with the recorded reason once triggered.
    pub async fn wait(&self) -> Option<String> {
        let mut fired = self.inner.fired.subscribe();
        // The sender lives as long as `self`, so this only returns once fired.
        let _ = fired.wait_for(|fired| *fired).await;
        self.reason()
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownLatch")
            .field("triggered", &self.is_triggered())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Progress of the main-process shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    ShutdownRequested,
    PluginsStopped,
    WorkerJoined,
    Terminated,
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: Option<String>,
    pub phase: ShutdownPhase,
    pub worker_pid: Option<u32>,
    /// The worker outlived its grace period and had to be terminated.
    pub forced: bool,
    /// Failure that caused the shutdown, if any.
    pub failure: Option<String>,
}

impl ShutdownReport {
    pub fn reason_text(&self) -> &str {
        describe(self.reason.as_deref())
    }

    pub fn exit_message(&self) -> String {
        format!("Shutdown complete ({})", self.reason_text())
    }
}

fn describe(reason: Option<&str>) -> &str {
    reason.unwrap_or(UNSPECIFIED_REASON)
}

/// Main-process variant of the shutdown protocol.
pub struct MainShutdown<'a> {
    host: &'a mut PluginHost,
    channels: &'a [Channel],
    broker: &'a Broker,
    worker: Option<&'a mut Worker>,
    grace_period: Duration,
}

impl<'a> MainShutdown<'a> {
    /// `channels` are stopped in order, main channel first.
    pub fn new(host: &'a mut PluginHost, channels: &'a [Channel], broker: &'a Broker) -> Self {
        Self {
            host,
            channels,
            broker,
            worker: None,
            grace_period: WORKER_GRACE_PERIOD,
        }
    }

    pub fn with_worker(mut self, worker: &'a mut Worker) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub async fn run(self, reason: Option<String>) -> ShutdownReport {
        let mut phase = ShutdownPhase::ShutdownRequested;
        tracing::info!(reason = %describe(reason.as_deref()), "Shutting down");

        self.host.shutdown_blocking();
        advance(&mut phase, ShutdownPhase::PluginsStopped);

        for channel in self.channels {
            channel.stop();
        }
        self.broker.stop().await;

        let mut worker_pid = None;
        let mut forced = false;
        if let Some(worker) = self.worker {
            let pid = worker.pid();
            worker_pid = Some(pid);

            if worker.join(self.grace_period).await {
                tracing::debug!(pid, "Networking process joined");
            } else {
                forced = true;
                tracing::warn!(
                    pid,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Networking process still alive after grace period, terminating it"
                );
                if let Err(e) = worker.terminate().await {
                    tracing::error!(pid, error = %e, "Failed to terminate networking process");
                }
            }
        }
        advance(&mut phase, ShutdownPhase::WorkerJoined);
        advance(&mut phase, ShutdownPhase::Terminated);

        tracing::info!(reason = %describe(reason.as_deref()), forced, "All processes stopped");

        ShutdownReport {
            reason,
            phase,
            worker_pid,
            forced,
            failure: None,
        }
    }
}

fn advance(phase: &mut ShutdownPhase, next: ShutdownPhase) {
    tracing::debug!(from = ?*phase, to = ?next, "Shutdown phase");
    *phase = next;
}
