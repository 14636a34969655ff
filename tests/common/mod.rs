//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use skein::config::cli::LaunchArgs;
use skein::ipc::{Channel, Event, EventKind};
use skein::lifecycle::launch::{LaunchPlan, WorkerLaunch};
use skein::lifecycle::process::{ProcessError, Worker, WorkerProcess, WorkerSpawner};
use skein::lifecycle::startup::prepare_launch;
use skein::node::{Service, ServiceError};
use skein::plugins::{Plugin, PluginContext, PluginError, PluginScope};
use skein::ShutdownLatch;

/// Ordered record of what happened, shared between fakes and the test.
pub type Timeline = Arc<Mutex<Vec<String>>>;

pub fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(timeline: &Timeline) -> Vec<String> {
    timeline.lock().unwrap().clone()
}

/// Environment lookup with the skein root pointed at `root`.
pub fn env_with_root(root: &Path) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<&str, String> = [("XDG_SKEIN_ROOT", root.display().to_string())]
        .into_iter()
        .collect();
    move |key| vars.get(key).cloned()
}

/// A launch plan for mainnet under a fresh root.
pub fn plan_in(root: &Path) -> LaunchPlan {
    prepare_launch(LaunchArgs::default(), &env_with_root(root)).unwrap()
}

/// Plugin that records its lifecycle and whether its channel was still up
/// when it was stopped.
pub struct RecordingPlugin {
    name: &'static str,
    scope: PluginScope,
    timeline: Timeline,
    starts: Arc<AtomicUsize>,
    channel: Option<Channel>,
}

impl RecordingPlugin {
    pub fn boxed(name: &'static str, scope: PluginScope, timeline: &Timeline) -> Box<dyn Plugin> {
        Box::new(Self::new(name, scope, timeline, &Arc::new(AtomicUsize::new(0))))
    }

    pub fn new(
        name: &'static str,
        scope: PluginScope,
        timeline: &Timeline,
        starts: &Arc<AtomicUsize>,
    ) -> Self {
        Self {
            name,
            scope,
            timeline: timeline.clone(),
            starts: starts.clone(),
            channel: None,
        }
    }
}

impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn scope(&self) -> PluginScope {
        self.scope
    }

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.channel = Some(ctx.channel.clone());
        self.timeline
            .lock()
            .unwrap()
            .push(format!("start {}", self.name));
        Ok(())
    }

    fn stop(&mut self) {
        let connected = self
            .channel
            .as_ref()
            .map(Channel::is_connected)
            .unwrap_or(false);
        self.timeline
            .lock()
            .unwrap()
            .push(format!("stop {} connected={}", self.name, connected));
    }
}

/// How a fake worker reacts once the main process waits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerBehaviour {
    /// Exits as soon as it is joined.
    ExitsWhenJoined,
    /// Never exits on its own.
    Hangs,
    /// Exits with a failure status right after it starts.
    Crashes,
}

/// What the test can observe about a fake worker.
#[derive(Clone, Default)]
pub struct WorkerRecord {
    pub joins: Arc<AtomicUsize>,
    pub terminations: Arc<AtomicUsize>,
    /// Time from spawn to the first termination.
    pub terminated_after: Arc<Mutex<Option<Duration>>>,
    pub launch: Arc<Mutex<Option<WorkerLaunch>>>,
}

pub struct FakeWorker {
    pid: u32,
    behaviour: WorkerBehaviour,
    exited: ShutdownLatch,
    spawned_at: Instant,
    record: WorkerRecord,
}

#[async_trait]
impl WorkerProcess for FakeWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        !self.exited.is_triggered()
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        self.record.joins.fetch_add(1, Ordering::SeqCst);
        if self.behaviour == WorkerBehaviour::ExitsWhenJoined {
            self.exited.trigger(Some("joined".into()));
        }
        tokio::time::timeout(timeout, self.exited.wait())
            .await
            .is_ok()
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        if self.record.terminations.fetch_add(1, Ordering::SeqCst) == 0 {
            *self.record.terminated_after.lock().unwrap() = Some(self.spawned_at.elapsed());
        }
        self.exited.trigger(Some("terminated".into()));
        Ok(())
    }

    async fn wait(&mut self) {
        self.exited.wait().await;
    }

    fn exit_failure(&self) -> Option<String> {
        (self.behaviour == WorkerBehaviour::Crashes && self.exited.is_triggered())
            .then(|| "networking process exit status: 1".to_string())
    }
}

pub struct FakeSpawner {
    behaviour: WorkerBehaviour,
    pub spawns: Arc<AtomicUsize>,
    pub record: WorkerRecord,
}

impl FakeSpawner {
    pub fn new(behaviour: WorkerBehaviour) -> Self {
        Self {
            behaviour,
            spawns: Arc::new(AtomicUsize::new(0)),
            record: WorkerRecord::default(),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&mut self, launch: &WorkerLaunch) -> Result<Worker, ProcessError> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst);
        *self.record.launch.lock().unwrap() = Some(launch.clone());
        let exited = ShutdownLatch::new();
        if self.behaviour == WorkerBehaviour::Crashes {
            exited.trigger(Some("crashed".into()));
        }
        Ok(Box::new(FakeWorker {
            pid: 40_000 + n as u32,
            behaviour: self.behaviour,
            exited,
            spawned_at: Instant::now(),
            record: self.record.clone(),
        }))
    }
}

/// Service that announces itself on the bus and then idles until cancelled.
pub struct AnnouncingService {
    channel: Channel,
    timeline: Timeline,
}

/// Topic the announcing service publishes once it runs.
pub const READY_TOPIC: &str = "ready";

impl AnnouncingService {
    pub fn boxed(channel: &Channel, timeline: &Timeline) -> Box<dyn Service> {
        Box::new(Self {
            channel: channel.clone(),
            timeline: timeline.clone(),
        })
    }
}

#[async_trait]
impl Service for AnnouncingService {
    fn name(&self) -> &str {
        "announcing"
    }

    async fn run(&mut self, cancel: ShutdownLatch) -> Result<(), ServiceError> {
        self.channel
            .publish(Event::Custom {
                topic: READY_TOPIC.into(),
                payload: serde_json::Value::Null,
            })
            .map_err(|e| ServiceError::Failed {
                service: "announcing".into(),
                message: e.to_string(),
            })?;
        let reason = cancel.wait().await;
        self.timeline.lock().unwrap().push(format!(
            "service cancelled: {}",
            reason.as_deref().unwrap_or("unspecified")
        ));
        Ok(())
    }
}

/// Latch triggered the first time `topic` arrives on `channel`.
pub fn on_topic(channel: &Channel, topic: &str) -> ShutdownLatch {
    let seen = ShutdownLatch::new();
    let trigger = seen.clone();
    channel
        .subscribe(EventKind::Custom(topic.into()), move |_| {
            trigger.trigger(None);
            Ok(())
        })
        .unwrap();
    seen
}

/// Wait for `latch` with a generous deadline.
pub async fn within(latch: &ShutdownLatch) {
    tokio::time::timeout(Duration::from_secs(5), latch.wait())
        .await
        .expect("timed out waiting for the bus");
}

/// Log output of the current thread, captured as plain text.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route this thread's logs into the capture until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
