//! Worker process handle.
//!
//! # Responsibilities
//! - Spawn the networking process by re-executing the current binary
//! - Hand it the launch payload on stdin and attach the log listener
//! - Bounded, non-blocking join and platform-specific escalation
//!
//! # Design Decisions
//! - `WorkerProcess` is a trait so supervision can be driven by fakes
//! - Joining polls `try_wait` between Tokio sleeps instead of blocking the loop
//! - Once the exit is seen the log listener gets a short, bounded drain
//! - Escalation on unix: SIGINT, wait 5s, SIGTERM, wait 3s, SIGKILL

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::cli::WORKER_SUBCOMMAND;
use crate::lifecycle::launch::{LogQueue, WorkerLaunch};
use crate::observability::forward::LogListener;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time the worker gets to react to SIGINT before SIGTERM.
pub const INTERRUPT_WAIT: Duration = Duration::from_secs(5);

/// Time the worker gets to react to SIGTERM before SIGKILL.
pub const TERMINATE_WAIT: Duration = Duration::from_secs(3);

/// How long the log listener may keep draining after the worker exited.
pub const LOG_DRAIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("cannot locate the skein executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("cannot spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot hand the launch payload to the worker: {0}")]
    Handoff(#[source] io::Error),

    #[error("cannot signal worker {pid}: {message}")]
    Signal { pid: u32, message: String },
}

/// A running worker, as seen from the main process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    fn is_alive(&mut self) -> bool;

    /// Wait up to `timeout` for the process to exit. Returns true once it has.
    async fn join(&mut self, timeout: Duration) -> bool;

    /// Forcefully stop the process.
    async fn terminate(&mut self) -> Result<(), ProcessError>;

    /// Resolve when the process exits on its own.
    async fn wait(&mut self) {
        while !self.join(Duration::from_secs(1)).await {}
    }

    /// Why the exit counts as a failure, if it does.
    fn exit_failure(&self) -> Option<String> {
        None
    }
}

pub type Worker = Box<dyn WorkerProcess>;

/// Starts the worker process.
pub trait WorkerSpawner {
    fn spawn(&mut self, launch: &WorkerLaunch) -> Result<Worker, ProcessError>;
}

/// Spawns `<program> worker`, normally the running executable.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn current_exe() -> Result<Self, ProcessError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(ProcessError::CurrentExe)
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&mut self, launch: &WorkerLaunch) -> Result<Worker, ProcessError> {
        let forward_logs = launch.extras.log_queue == LogQueue::ParentStderr;

        let mut command = Command::new(&self.program);
        command
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(if forward_logs {
                Stdio::piped()
            } else {
                Stdio::inherit()
            });

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let logs = match child.stderr.take() {
            Some(stderr) if forward_logs => match LogListener::spawn(stderr) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProcessError::Handoff(e));
                }
            },
            _ => None,
        };

        // Dropping stdin after the payload is written signals end of input.
        let handoff = match child.stdin.take() {
            Some(stdin) => launch.write_to(stdin),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker stdin was not captured",
            )),
        };
        if let Err(e) = handoff {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::Handoff(e));
        }

        tracing::info!(
            pid = child.id(),
            program = %self.program.display(),
            "Networking process started"
        );
        Ok(Box::new(ChildWorker::new(child, logs)))
    }
}

/// A worker backed by an OS child process.
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
    pid: u32,
    status: Option<ExitStatus>,
    logs: Option<LogListener>,
    forwarded: Option<u64>,
}

impl ChildWorker {
    pub fn new(child: Child, logs: Option<LogListener>) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            status: None,
            logs,
            forwarded: None,
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Records the log listener forwarded, once it has been drained.
    pub fn forwarded_records(&self) -> Option<u64> {
        self.forwarded
    }

    fn has_exited(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(pid = self.pid, status = %status, "Networking process exited");
                self.status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Cannot query networking process");
                false
            }
        }
    }

    async fn drain_log_listener(&mut self) {
        let Some(logs) = self.logs.take() else {
            return;
        };
        let deadline = Instant::now() + LOG_DRAIN_WAIT;
        while !logs.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
        if logs.is_finished() {
            let records = logs.join();
            tracing::debug!(pid = self.pid, records, "Worker log stream drained");
            self.forwarded = Some(records);
        } else {
            // Something else still holds the pipe open.
            tracing::warn!(pid = self.pid, "Worker log stream still open, detaching listener");
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => return Ok(()),
            Err(e) => {
                return Err(ProcessError::Signal {
                    pid: self.pid,
                    message: e.to_string(),
                })
            }
        }
        if !self.join(TERMINATE_WAIT).await {
            tracing::error!(pid = self.pid, "Networking process survived SIGKILL");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        !self.has_exited()
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                self.drain_log_listener().await;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    #[cfg(unix)]
    async fn terminate(&mut self) -> Result<(), ProcessError> {
        use nix::sys::signal::Signal;

        for (signal, wait) in [
            (Signal::SIGINT, INTERRUPT_WAIT),
            (Signal::SIGTERM, TERMINATE_WAIT),
        ] {
            if self.has_exited() {
                return Ok(());
            }
            tracing::warn!(pid = self.pid, signal = signal.as_str(), "Signalling networking process");
            send_signal(self.pid, signal)?;
            if self.join(wait).await {
                return Ok(());
            }
        }

        tracing::error!(pid = self.pid, "Networking process ignored SIGINT and SIGTERM, killing it");
        self.kill().await
    }

    fn exit_failure(&self) -> Option<String> {
        self.status
            .filter(|status| !status.success())
            .map(|status| format!("networking process {}", status))
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }
        tracing::warn!(pid = self.pid, "Killing networking process");
        self.kill().await
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        message: "pid out of range".into(),
    })?;
    match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
        // Already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn(script: &str) -> ChildWorker {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        ChildWorker::new(child, None)
    }

    #[tokio::test]
    async fn test_join_returns_once_exited() {
        let mut worker = spawn("exit 0");
        assert!(worker.join(Duration::from_secs(5)).await);
        assert!(!worker.is_alive());
        assert!(worker.exit_status().is_some_and(|s| s.success()));
    }

    #[tokio::test]
    async fn test_join_times_out_on_live_process() {
        let mut worker = spawn("sleep 30");
        assert!(!worker.join(Duration::from_millis(100)).await);
        assert!(worker.is_alive());
        worker.terminate().await.unwrap();
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let mut worker = spawn("exit 3");
        assert!(worker.join(Duration::from_secs(5)).await);
        worker.terminate().await.unwrap();
        assert_eq!(worker.exit_status().and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_failure() {
        let mut worker = spawn("exit 3");
        assert_eq!(worker.exit_failure(), None);
        worker.wait().await;
        let failure = worker.exit_failure().unwrap();
        assert!(failure.contains('3'), "{}", failure);

        let mut clean = spawn("exit 0");
        clean.wait().await;
        assert_eq!(clean.exit_failure(), None);
    }

    #[tokio::test]
    async fn test_log_stream_is_drained_after_exit() {
        // The writer exits before the listener has necessarily read everything.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("for i in 1 2 3 4 5; do echo line $i >&2; done")
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().unwrap();
        let mut worker = ChildWorker::new(child, Some(LogListener::spawn(stderr).unwrap()));

        assert!(worker.join(Duration::from_secs(5)).await);
        assert_eq!(worker.forwarded_records(), Some(5));
    }
}
