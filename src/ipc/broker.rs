//! The process-wide event broker.
//!
//! # Responsibilities
//! - Own the routing table (channel name → sink + subscribed kinds)
//! - Accept remote channels on a unix socket and bridge them to the router
//! - Queue local commands issued before `start`, drain them on `stop`

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::ipc::channel::Channel;
use crate::ipc::event::{Event, EventKind};
use crate::ipc::wire::{self, Frame};
use crate::ipc::{BrokerError, ChannelError};

/// How long remote connections get to flush pending deliveries on stop.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// Allocate an id distinguishing successive attachments of the same channel name.
pub(crate) fn next_link_id() -> u64 {
    NEXT_LINK.fetch_add(1, Ordering::Relaxed)
}

/// An event routed to a channel, tagged with the publishing channel.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub origin: String,
    pub event: Event,
}

pub(crate) enum RouterCommand {
    Attach {
        channel: String,
        link: u64,
        sink: mpsc::UnboundedSender<Delivery>,
    },
    Detach {
        channel: String,
        link: u64,
    },
    Subscribe {
        channel: String,
        kind: EventKind,
    },
    Unsubscribe {
        channel: String,
        kind: EventKind,
    },
    Publish {
        origin: String,
        event: Event,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Lifecycle of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Running,
    Stopped,
}

/// Handle to the event broker. Clones share the same router.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    commands: mpsc::UnboundedSender<RouterCommand>,
    /// Receiver side of `commands`, parked here until `start`.
    pending: Mutex<Option<mpsc::UnboundedReceiver<RouterCommand>>>,
    state: Mutex<BrokerState>,
    endpoint: Mutex<Option<PathBuf>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: Mutex<Option<oneshot::Sender<()>>>,
}

impl Broker {
    pub fn new() -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BrokerInner {
                commands,
                pending: Mutex::new(Some(pending)),
                state: Mutex::new(BrokerState::Created),
                endpoint: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                closing: Mutex::new(None),
            }),
        }
    }

    /// Allocate a named channel bound to this broker.
    ///
    /// The channel is returned disconnected. Channels meant for another
    /// process are handed over with [`Channel::identity`] instead.
    pub fn create_channel(&self, name: impl Into<String>) -> Channel {
        Channel::local(name.into(), self.clone())
    }

    pub fn state(&self) -> BrokerState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == BrokerState::Running
    }

    /// Socket path remote channels connect to, once started.
    pub fn endpoint(&self) -> Option<PathBuf> {
        self.inner.endpoint.lock().clone()
    }

    /// Bind `endpoint` and begin routing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, endpoint: impl Into<PathBuf>) -> Result<(), BrokerError> {
        let endpoint = endpoint.into();
        let mut state = self.inner.state.lock();
        match *state {
            BrokerState::Running => return Err(BrokerError::AlreadyStarted),
            BrokerState::Stopped => return Err(BrokerError::Stopped),
            BrokerState::Created => {}
        }

        clear_stale_endpoint(&endpoint)?;
        let listener = UnixListener::bind(&endpoint).map_err(|source| BrokerError::Bind {
            path: endpoint.clone(),
            source,
        })?;

        let receiver = self
            .inner
            .pending
            .lock()
            .take()
            .ok_or(BrokerError::AlreadyStarted)?;

        let (closing, closed) = oneshot::channel();
        let router = tokio::spawn(route(receiver));
        let acceptor = tokio::spawn(accept_loop(listener, self.inner.commands.clone(), closed));
        self.inner.tasks.lock().extend([router, acceptor]);
        *self.inner.closing.lock() = Some(closing);

        *self.inner.endpoint.lock() = Some(endpoint.clone());
        *state = BrokerState::Running;

        tracing::info!(endpoint = %endpoint.display(), "Event broker started");
        Ok(())
    }

    /// Stop routing and release the endpoint.
    ///
    /// Commands queued before this call are routed first. Calling `stop`
    /// again, or on a broker that never started, only marks it stopped.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut *state, BrokerState::Stopped)
        };

        match previous {
            BrokerState::Stopped => return,
            BrokerState::Created => {
                self.inner.pending.lock().take();
                tracing::debug!("Event broker stopped before it was started");
                return;
            }
            BrokerState::Running => {}
        }

        // Bypasses `send`, which already rejects commands.
        let (done, drained) = oneshot::channel();
        if self.inner.commands.send(RouterCommand::Stop { done }).is_ok() {
            let _ = drained.await;
        }

        // The router dropped every sink; connections end once flushed.
        if let Some(closing) = self.inner.closing.lock().take() {
            let _ = closing.send(());
        }
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::warn!("Broker connections did not drain in time");
                abort.abort();
            }
        }

        if let Some(endpoint) = self.inner.endpoint.lock().take() {
            remove_socket(&endpoint);
        }

        tracing::info!("Event broker stopped");
    }

    pub(crate) fn send(&self, command: RouterCommand) -> Result<(), ChannelError> {
        if self.state() == BrokerState::Stopped {
            return Err(ChannelError::NotRunning);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| ChannelError::NotRunning)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

/// Remove a socket file left behind by a crashed run.
///
/// Fails with `InUse` when a broker still accepts connections on
/// `endpoint`. Returns whether a stale file was removed.
pub fn clear_stale_endpoint(endpoint: &Path) -> Result<bool, BrokerError> {
    use std::io::ErrorKind;

    match std::os::unix::net::UnixStream::connect(endpoint) {
        Ok(_) => Err(BrokerError::InUse {
            path: endpoint.to_path_buf(),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            std::fs::remove_file(endpoint).map_err(|source| BrokerError::Bind {
                path: endpoint.to_path_buf(),
                source,
            })?;
            tracing::info!(endpoint = %endpoint.display(), "Removed stale broker socket");
            Ok(true)
        }
        Err(source) => Err(BrokerError::Bind {
            path: endpoint.to_path_buf(),
            source,
        }),
    }
}

fn remove_socket(endpoint: &Path) {
    if let Err(e) = std::fs::remove_file(endpoint) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(endpoint = %endpoint.display(), error = %e, "Failed to remove broker socket");
        }
    }
}

struct Route {
    link: u64,
    sink: mpsc::UnboundedSender<Delivery>,
    kinds: HashSet<EventKind>,
}

async fn route(mut commands: mpsc::UnboundedReceiver<RouterCommand>) {
    let mut routes: HashMap<String, Route> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            RouterCommand::Attach { channel, link, sink } => {
                let route = Route {
                    link,
                    sink,
                    kinds: HashSet::new(),
                };
                if routes.insert(channel.clone(), route).is_some() {
                    tracing::warn!(channel = %channel, "Channel re-attached, previous link dropped");
                }
                tracing::debug!(channel = %channel, link, "Channel attached");
            }
            RouterCommand::Detach { channel, link } => {
                if routes.get(&channel).is_some_and(|route| route.link == link) {
                    routes.remove(&channel);
                    tracing::debug!(channel = %channel, link, "Channel detached");
                }
            }
            RouterCommand::Subscribe { channel, kind } => {
                if let Some(route) = routes.get_mut(&channel) {
                    route.kinds.insert(kind);
                }
            }
            RouterCommand::Unsubscribe { channel, kind } => {
                if let Some(route) = routes.get_mut(&channel) {
                    route.kinds.remove(&kind);
                }
            }
            RouterCommand::Publish { origin, event } => {
                let kind = event.kind();
                let mut receivers = 0usize;
                for (name, route) in &routes {
                    if *name == origin || !route.kinds.contains(&kind) {
                        continue;
                    }
                    let delivery = Delivery {
                        origin: origin.clone(),
                        event: event.clone(),
                    };
                    if route.sink.send(delivery).is_ok() {
                        receivers += 1;
                    }
                }
                tracing::trace!(origin = %origin, kind = %kind, receivers, "Event routed");
            }
            RouterCommand::Stop { done } => {
                let _ = done.send(());
                break;
            }
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    commands: mpsc::UnboundedSender<RouterCommand>,
    mut closed: oneshot::Receiver<()>,
) {
    // Dropping the set when this task is aborted tears down every connection.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut closed => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(stream, commands.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept broker connection");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(stream: UnixStream, commands: mpsc::UnboundedSender<RouterCommand>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let channel = match lines.next_line().await {
        Ok(Some(line)) => match wire::decode(&line) {
            Ok(Frame::Hello { channel }) => channel,
            Ok(frame) => {
                tracing::warn!(?frame, "Remote channel sent data before introducing itself");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejected broker connection");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "Broker connection failed during handshake");
            return;
        }
    };

    let link = next_link_id();
    let (sink, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
    let attach = RouterCommand::Attach {
        channel: channel.clone(),
        link,
        sink,
    };
    if commands.send(attach).is_err() {
        return;
    }

    let outbound = async move {
        while let Some(delivery) = deliveries.recv().await {
            let frame = Frame::Deliver {
                origin: delivery.origin,
                event: delivery.event,
            };
            let line = match wire::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undeliverable event");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    };

    let inbound = async {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(channel = %channel, error = %e, "Broker connection read failed");
                    break;
                }
            };
            let command = match wire::decode(&line) {
                Ok(Frame::Subscribe { kind }) => RouterCommand::Subscribe {
                    channel: channel.clone(),
                    kind,
                },
                Ok(Frame::Unsubscribe { kind }) => RouterCommand::Unsubscribe {
                    channel: channel.clone(),
                    kind,
                },
                Ok(Frame::Publish { event }) => RouterCommand::Publish {
                    origin: channel.clone(),
                    event,
                },
                Ok(frame) => {
                    tracing::warn!(channel = %channel, ?frame, "Unexpected frame from remote channel");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Ignoring malformed frame");
                    continue;
                }
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }

    let _ = commands.send(RouterCommand::Detach { channel, link });
}
