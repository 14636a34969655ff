//! Named, reconnectable endpoints into the broker.
//!
//! # Responsibilities
//! - Track connection state and the subscription table
//! - Forward subscriptions and publications to the broker
//! - Run handlers for local publications and for deliveries from the broker
//!
//! A channel created by [`Broker::create_channel`] talks to the router
//! in-process. A channel rebuilt from a [`ChannelIdentity`] in another
//! process talks to it over the broker socket.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ipc::broker::{next_link_id, Broker, Delivery, RouterCommand};
use crate::ipc::event::{Event, EventKind};
use crate::ipc::wire::{self, Frame};
use crate::ipc::{ChannelError, HandlerError};

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Handle returned by [`Channel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Everything another process needs to connect to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub name: String,
    /// Broker socket path.
    pub endpoint: PathBuf,
}

enum Link {
    Local(Broker),
    Remote(PathBuf),
}

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

enum Outbound {
    Local { broker: Broker, link: u64 },
    Remote(mpsc::UnboundedSender<Frame>),
}

struct Session {
    outbound: Outbound,
    pump: JoinHandle<()>,
}

struct ChannelInner {
    name: String,
    link: Link,
    state: Mutex<ChannelState>,
    subscribers: Mutex<Vec<Subscriber>>,
    session: Mutex<Option<Session>>,
    fault: watch::Sender<Option<ChannelError>>,
    next_subscription: AtomicU64,
}

/// A named pub/sub endpoint. Clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn local(name: String, broker: Broker) -> Self {
        Self::with_link(name, Link::Local(broker))
    }

    /// Rebuild a channel handed over from another process.
    pub fn attach(identity: ChannelIdentity) -> Self {
        Self::with_link(identity.name, Link::Remote(identity.endpoint))
    }

    fn with_link(name: String, link: Link) -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            inner: Arc::new(ChannelInner {
                name,
                link,
                state: Mutex::new(ChannelState::Disconnected),
                subscribers: Mutex::new(Vec::new()),
                session: Mutex::new(None),
                fault,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Identity to hand to another process.
    ///
    /// Fails with `NotRunning` for a local channel whose broker has not
    /// been started yet, since there is no endpoint to connect to.
    pub fn identity(&self) -> Result<ChannelIdentity, ChannelError> {
        let endpoint = match &self.inner.link {
            Link::Local(broker) => broker.endpoint().ok_or(ChannelError::NotRunning)?,
            Link::Remote(endpoint) => endpoint.clone(),
        };
        Ok(ChannelIdentity {
            name: self.inner.name.clone(),
            endpoint,
        })
    }

    /// Connect to the broker.
    ///
    /// Existing subscriptions are re-announced, so a stopped channel can be
    /// reconnected. Connecting twice without a `stop` in between fails.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.state.lock();
            if *state != ChannelState::Disconnected {
                return Err(ChannelError::AlreadyConnected(self.inner.name.clone()));
            }
            *state = ChannelState::Connecting;
        }

        let session = match &self.inner.link {
            Link::Local(broker) => self.connect_local(broker),
            Link::Remote(endpoint) => self.connect_remote(endpoint).await,
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                *self.inner.state.lock() = ChannelState::Disconnected;
                return Err(e);
            }
        };

        *self.inner.session.lock() = Some(session);
        *self.inner.state.lock() = ChannelState::Connected;

        for kind in self.subscribed_kinds() {
            self.forward(Frame::Subscribe { kind })?;
        }

        tracing::debug!(channel = %self.inner.name, "Channel connected");
        Ok(())
    }

    fn connect_local(&self, broker: &Broker) -> Result<Session, ChannelError> {
        let link = next_link_id();
        let (sink, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
        broker.send(RouterCommand::Attach {
            channel: self.inner.name.clone(),
            link,
            sink,
        })?;

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.deliver(&delivery.origin, &delivery.event);
            }
        });

        Ok(Session {
            outbound: Outbound::Local {
                broker: broker.clone(),
                link,
            },
            pump,
        })
    }

    async fn connect_remote(&self, endpoint: &Path) -> Result<Session, ChannelError> {
        let stream = UnixStream::connect(endpoint).await.map_err(|e| {
            ChannelError::Transport(format!(
                "cannot reach broker at {}: {}",
                endpoint.display(),
                e
            ))
        })?;

        let (frames, outgoing) = mpsc::unbounded_channel::<Frame>();
        frames
            .send(Frame::Hello {
                channel: self.inner.name.clone(),
            })
            .map_err(|_| ChannelError::NotRunning)?;

        let pump = tokio::spawn(pump_remote(stream, outgoing, Arc::downgrade(&self.inner)));

        Ok(Session {
            outbound: Outbound::Remote(frames),
            pump,
        })
    }

    /// Register `handler` for every future event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<SubscriptionId, ChannelError>
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.ensure_connected()?;

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let first_of_kind = {
            let mut subscribers = self.inner.subscribers.lock();
            let first = !subscribers.iter().any(|s| s.kind == kind);
            subscribers.push(Subscriber {
                id,
                kind: kind.clone(),
                handler: Arc::new(handler),
            });
            first
        };

        if first_of_kind {
            if let Err(e) = self.forward(Frame::Subscribe { kind: kind.clone() }) {
                self.inner.subscribers.lock().retain(|s| s.id != id);
                return Err(e);
            }
        }

        tracing::debug!(channel = %self.inner.name, kind = %kind, "Subscribed");
        Ok(id)
    }

    /// Remove one handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, last_of_kind) = {
            let mut subscribers = self.inner.subscribers.lock();
            let Some(index) = subscribers.iter().position(|s| s.id == id) else {
                return false;
            };
            let removed = subscribers.remove(index);
            let last = !subscribers.iter().any(|s| s.kind == removed.kind);
            (removed, last)
        };

        if last_of_kind && self.is_connected() {
            if let Err(e) = self.forward(Frame::Unsubscribe {
                kind: removed.kind.clone(),
            }) {
                tracing::debug!(channel = %self.inner.name, error = %e, "Unsubscribe not forwarded");
            }
        }
        true
    }

    pub fn subscriber_count(&self, kind: &EventKind) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| &s.kind == kind)
            .count()
    }

    /// Deliver `event` to local subscribers and forward it to the broker.
    ///
    /// The first failing local handler is returned as `ChannelError::Handler`.
    pub fn publish(&self, event: Event) -> Result<(), ChannelError> {
        self.ensure_connected()?;
        self.forward(Frame::Publish {
            event: event.clone(),
        })?;
        self.inner.dispatch(&event)
    }

    /// Disconnect from the broker. No-op unless connected.
    ///
    /// Publications already accepted are still flushed to the broker.
    pub fn stop(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            if *state != ChannelState::Connected {
                return;
            }
            *state = ChannelState::Disconnected;
            self.inner.session.lock().take()
        };

        if let Some(session) = session {
            match session.outbound {
                Outbound::Local { broker, link } => {
                    let _ = broker.send(RouterCommand::Detach {
                        channel: self.inner.name.clone(),
                        link,
                    });
                    session.pump.abort();
                }
                // Dropping the sender lets the writer drain and close the socket.
                Outbound::Remote(frames) => drop(frames),
            }
        }

        tracing::info!(channel = %self.inner.name, "Channel stopped");
    }

    /// First failure seen on a delivered event or on the broker link, if any.
    pub fn fault(&self) -> Option<ChannelError> {
        (*self.inner.fault.borrow()).clone()
    }

    /// Resolve once a handler fails on a delivered event or the broker
    /// drops a remote channel's connection.
    pub async fn failed(&self) -> ChannelError {
        let mut faults = self.inner.fault.subscribe();
        loop {
            let current = (*faults.borrow_and_update()).clone();
            if let Some(fault) = current {
                return fault;
            }
            if faults.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChannelError::NotConnected(self.inner.name.clone()))
        }
    }

    fn subscribed_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = Vec::new();
        for subscriber in self.inner.subscribers.lock().iter() {
            if !kinds.contains(&subscriber.kind) {
                kinds.push(subscriber.kind.clone());
            }
        }
        kinds
    }

    fn forward(&self, frame: Frame) -> Result<(), ChannelError> {
        let session = self.inner.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(ChannelError::NotConnected(self.inner.name.clone()));
        };

        match &session.outbound {
            Outbound::Local { broker, .. } => {
                let channel = self.inner.name.clone();
                let command = match frame {
                    Frame::Publish { event } => RouterCommand::Publish {
                        origin: channel,
                        event,
                    },
                    Frame::Subscribe { kind } => RouterCommand::Subscribe { channel, kind },
                    Frame::Unsubscribe { kind } => RouterCommand::Unsubscribe { channel, kind },
                    frame => {
                        return Err(ChannelError::Transport(format!(
                            "frame not valid on a local link: {:?}",
                            frame
                        )))
                    }
                };
                broker.send(command)
            }
            Outbound::Remote(frames) => frames.send(frame).map_err(|_| ChannelError::NotRunning),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelInner {
    fn dispatch(&self, event: &Event) -> Result<(), ChannelError> {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or publish without deadlocking.
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(event).map_err(|source| ChannelError::Handler {
                channel: self.name.clone(),
                kind: kind.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn deliver(&self, origin: &str, event: &Event) {
        if let Err(e) = self.dispatch(event) {
            tracing::error!(
                channel = %self.name,
                origin = %origin,
                error = %e,
                "Subscriber failed on delivered event"
            );
            self.latch_fault(e);
        }
    }

    /// Keep the first fault; later ones are only logged.
    fn latch_fault(&self, error: ChannelError) {
        self.fault.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(error);
                true
            } else {
                false
            }
        });
    }
}

async fn pump_remote(
    stream: UnixStream,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    channel: Weak<ChannelInner>,
) {
    let (reader, mut writer) = stream.into_split();

    let write_half = async move {
        while let Some(frame) = outgoing.recv().await {
            let line = match wire::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    };

    let read_half = async {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match wire::decode(&line) {
                    Ok(Frame::Deliver { origin, event }) => {
                        let Some(inner) = channel.upgrade() else { return };
                        inner.deliver(&origin, &event);
                    }
                    Ok(frame) => tracing::warn!(?frame, "Unexpected frame from broker"),
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed frame from broker"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Broker connection read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = write_half => {}
        _ = read_half => {}
    }

    if let Some(inner) = channel.upgrade() {
        // Still connected means the broker went away, not a local `stop`.
        if *inner.state.lock() == ChannelState::Connected {
            tracing::warn!(channel = %inner.name, "Broker closed the connection");
            inner.latch_fault(ChannelError::NotRunning);
        } else {
            tracing::debug!(channel = %inner.name, "Broker connection closed");
        }
    }
}
