//! Duplex link to the orchestrator with reconnect and connection epochs.
//!
//! Frames are read by a per-link supervisor task and handed to a single
//! delivery task, so handlers for one transport never run concurrently and
//! observe frames in receive order. Every established link gets a fresh
//! [`ConnectionEpoch`]; frames from any other epoch are dropped.

mod websocket;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::ConnectionEpoch,
    error::SyncError,
    protocol::{Topic, WireFrame},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    settings::SyncSettings,
    subscription::{lock, ListenerSet, Subscription, SubscriptionId},
};

pub use websocket::WsConnector;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        epoch: ConnectionEpoch,
    },
    Reconnecting {
        attempt: u32,
        next_retry_ms: u64,
    },
    /// Connect attempts are exhausted. Background retries may still bring
    /// the link back after a loss.
    Unavailable,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected { epoch } => write!(f, "connected (epoch {epoch})"),
            ConnectionState::Reconnecting {
                attempt,
                next_retry_ms,
            } => write!(f, "reconnecting (attempt {attempt}, retry in {next_retry_ms}ms)"),
            ConnectionState::Unavailable => f.write_str("unavailable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub epoch: ConnectionEpoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochTransition {
    Started {
        epoch: ConnectionEpoch,
        previous: Option<ConnectionEpoch>,
    },
    Ended {
        epoch: ConnectionEpoch,
    },
}

/// One decoded frame of a known topic, tagged with the link it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub epoch: ConnectionEpoch,
    pub topic: Topic,
    pub payload: Value,
}

/// Text pipes of one established link. The link is considered lost as soon
/// as `inbound` yields `None`.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl Link {
    /// Two cross-wired ends: what one side sends, the other receives.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let capacity = capacity.max(1);
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Opens the wire-level link for a given epoch.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, epoch: ConnectionEpoch) -> Result<Link, SyncError>;
}

enum Delivery {
    Started {
        epoch: ConnectionEpoch,
        previous: Option<ConnectionEpoch>,
    },
    Ended {
        epoch: ConnectionEpoch,
    },
    Frame {
        epoch: ConnectionEpoch,
        text: String,
    },
}

/// Listener registry owned by the delivery task.
#[derive(Default)]
struct Dispatch {
    topics: Mutex<HashMap<Topic, ListenerSet<InboundFrame>>>,
    epoch_hooks: ListenerSet<EpochTransition>,
    current: Mutex<Option<ConnectionEpoch>>,
    malformed: AtomicU64,
}

impl Dispatch {
    fn listeners(&self, topic: Topic) -> ListenerSet<InboundFrame> {
        lock(&self.topics).entry(topic).or_default().clone()
    }

    fn handle(&self, delivery: Delivery) {
        match delivery {
            Delivery::Started { epoch, previous } => {
                *lock(&self.current) = Some(epoch);
                self.epoch_hooks
                    .emit(&EpochTransition::Started { epoch, previous });
            }
            Delivery::Ended { epoch } => {
                {
                    let mut current = lock(&self.current);
                    if *current == Some(epoch) {
                        *current = None;
                    }
                }
                self.epoch_hooks.emit(&EpochTransition::Ended { epoch });
            }
            Delivery::Frame { epoch, text } => self.deliver(epoch, &text),
        }
    }

    fn deliver(&self, epoch: ConnectionEpoch, text: &str) {
        if *lock(&self.current) != Some(epoch) {
            debug!(%epoch, "dropping frame from retired link");
            return;
        }
        let frame = match WireFrame::decode(text) {
            Ok(frame) => frame,
            Err(error) => return self.reject(&error),
        };
        if let Some(tagged) = frame.epoch {
            if tagged != epoch {
                debug!(topic = %frame.topic, %tagged, live = %epoch, "dropping stale-epoch frame");
                return;
            }
        }
        let Some(topic) = Topic::parse(&frame.topic) else {
            return self.reject(&SyncError::malformed(frame.topic, "unknown topic"));
        };
        let listeners = lock(&self.topics).get(&topic).cloned();
        if let Some(listeners) = listeners {
            listeners.emit(&InboundFrame {
                epoch,
                topic,
                payload: frame.payload,
            });
        }
    }

    fn reject(&self, error: &SyncError) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(%error, "dropping inbound frame");
    }
}

struct LiveLink {
    epoch: ConnectionEpoch,
    outbound: mpsc::Sender<String>,
}

/// State the supervisor task needs; never holds the task handles so that
/// dropping the last transport clone tears everything down.
struct Shared {
    settings: SyncSettings,
    connector: Arc<dyn Connector>,
    last_epoch: Mutex<Option<ConnectionEpoch>>,
    live: Mutex<Option<LiveLink>>,
    state: watch::Sender<ConnectionState>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Shared {
    fn candidate_epoch(&self) -> ConnectionEpoch {
        lock(&self.last_epoch)
            .map(ConnectionEpoch::next)
            .unwrap_or(ConnectionEpoch(1))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn go_live(&self, epoch: ConnectionEpoch, outbound: mpsc::Sender<String>) {
        let mut live = lock(&self.live);
        let previous = lock(&self.last_epoch).replace(epoch);
        *live = Some(LiveLink { epoch, outbound });
        let _ = self.deliveries.send(Delivery::Started { epoch, previous });
        self.set_state(ConnectionState::Connected { epoch });
        info!(%epoch, "link established");
    }

    /// Retires the link of `epoch` if it is still the live one.
    fn go_dark(&self, epoch: ConnectionEpoch) -> bool {
        let mut live = lock(&self.live);
        if live.as_ref().map(|link| link.epoch) != Some(epoch) {
            return false;
        }
        live.take();
        let _ = self.deliveries.send(Delivery::Ended { epoch });
        true
    }

    fn forward(&self, epoch: ConnectionEpoch, text: String) {
        let _ = self.deliveries.send(Delivery::Frame { epoch, text });
    }

    async fn open_once(&self) -> Result<(ConnectionEpoch, Link), SyncError> {
        let epoch = self.candidate_epoch();
        let link = self.connector.open(epoch).await?;
        Ok((epoch, link))
    }

    /// Bounded retry used by an explicit `connect`.
    async fn establish(&self) -> Result<(ConnectionEpoch, Link), SyncError> {
        let max_attempts = self.settings.max_connect_attempts.max(1);
        let mut attempt = 1;
        self.set_state(ConnectionState::Connecting);
        loop {
            match self.open_once().await {
                Ok(opened) => return Ok(opened),
                Err(error) if attempt >= max_attempts => {
                    warn!(attempt, %error, "giving up on connect");
                    self.set_state(ConnectionState::Unavailable);
                    return Err(SyncError::unavailable(format!(
                        "no link after {attempt} attempts: {error}"
                    )));
                }
                Err(error) => {
                    let delay = self.settings.backoff_for(attempt);
                    warn!(attempt, %error, retry_in_ms = delay.as_millis() as u64, "connect attempt failed");
                    self.set_state(ConnectionState::Reconnecting {
                        attempt,
                        next_retry_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Unbounded retry after a link loss. Past `max_connect_attempts` the state
    /// reads `Unavailable` while retries continue at the backoff ceiling.
    async fn reestablish(&self) -> (ConnectionEpoch, Link) {
        let max_attempts = self.settings.max_connect_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            let delay = self.settings.backoff_for(attempt);
            if attempt > max_attempts {
                self.set_state(ConnectionState::Unavailable);
            } else {
                self.set_state(ConnectionState::Reconnecting {
                    attempt,
                    next_retry_ms: delay.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
            match self.open_once().await {
                Ok(opened) => return opened,
                Err(error) => {
                    warn!(attempt, %error, "reconnect attempt failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut epoch: ConnectionEpoch, mut inbound: mpsc::Receiver<String>) {
    loop {
        while let Some(text) = inbound.recv().await {
            shared.forward(epoch, text);
        }
        if !shared.go_dark(epoch) {
            return;
        }
        warn!(%epoch, "link lost, reconnecting");

        let (next_epoch, link) = shared.reestablish().await;
        shared.go_live(next_epoch, link.outbound);
        epoch = next_epoch;
        inbound = link.inbound;
    }
}

struct Inner {
    shared: Arc<Shared>,
    dispatch: Arc<Dispatch>,
    session: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.delivery).take() {
            handle.abort();
        }
    }
}

/// Reconnecting duplex channel carrying topic frames.
///
/// Must be created inside a Tokio runtime; the delivery task starts
/// immediately. Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<Inner>,
}

impl ChannelTransport {
    pub fn new(settings: SyncSettings, connector: Arc<dyn Connector>) -> Self {
        let (deliveries, mut queue) = mpsc::unbounded_channel::<Delivery>();
        let dispatch = Arc::new(Dispatch::default());

        let delivery_dispatch = Arc::clone(&dispatch);
        let delivery = tokio::spawn(async move {
            while let Some(delivery) = queue.recv().await {
                delivery_dispatch.handle(delivery);
            }
        });

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    settings,
                    connector,
                    last_epoch: Mutex::new(None),
                    live: Mutex::new(None),
                    state,
                    deliveries,
                }),
                dispatch,
                session: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
                delivery: Mutex::new(Some(delivery)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.shared.settings
    }

    /// Returns the live link, establishing one if needed.
    pub async fn connect(&self) -> Result<ConnectionHandle, SyncError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::unavailable("transport disposed"));
        }
        let _session = self.inner.session.lock().await;
        if let Some(epoch) = self.epoch() {
            return Ok(ConnectionHandle { epoch });
        }
        self.stop_supervisor().await;

        let shared = Arc::clone(&self.inner.shared);
        let (epoch, link) = shared.establish().await?;
        shared.go_live(epoch, link.outbound);
        let handle = tokio::spawn(supervise(shared, epoch, link.inbound));
        *lock(&self.inner.supervisor) = Some(handle);
        Ok(ConnectionHandle { epoch })
    }

    /// Tears the live link down. The next `connect` starts a new epoch.
    pub async fn disconnect(&self) {
        let _session = self.inner.session.lock().await;
        self.stop_supervisor().await;
        let live_epoch = self.epoch();
        if let Some(epoch) = live_epoch {
            self.inner.shared.go_dark(epoch);
            info!(%epoch, "link closed");
        }
        self.inner.shared.set_state(ConnectionState::Disconnected);
    }

    /// Disconnects and stops delivering. Later `connect` calls fail.
    pub async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.disconnect().await;
        let delivery = lock(&self.inner.delivery).take();
        if let Some(handle) = delivery {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(&InboundFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.dispatch.listeners(topic).insert(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let sets: Vec<_> = lock(&self.inner.dispatch.topics)
            .values()
            .cloned()
            .collect();
        sets.iter().any(|set| set.remove(id)) || self.inner.dispatch.epoch_hooks.remove(id)
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner.dispatch.listeners(topic).len()
    }

    /// Queues one frame on the live link without waiting.
    pub fn publish(&self, topic: Topic, payload: Value) -> Result<(), SyncError> {
        let live = lock(&self.inner.shared.live);
        let Some(link) = live.as_ref() else {
            return Err(SyncError::unavailable("not connected"));
        };
        let text = WireFrame::new(topic, payload)
            .with_epoch(link.epoch)
            .encode()?;
        link.outbound.try_send(text).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SyncError::unavailable("outbound queue full"),
            mpsc::error::TrySendError::Closed(_) => SyncError::unavailable("link closed"),
        })
    }

    /// Hooks run on the delivery task, before any frame of the new epoch.
    pub fn on_epoch_change(
        &self,
        hook: impl Fn(&EpochTransition) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.dispatch.epoch_hooks.insert(hook)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    pub fn epoch(&self) -> Option<ConnectionEpoch> {
        lock(&self.inner.shared.live).as_ref().map(|link| link.epoch)
    }

    pub fn malformed_frames(&self) -> u64 {
        self.inner.dispatch.malformed.load(Ordering::Relaxed)
    }

    async fn stop_supervisor(&self) {
        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
#[path = "../tests/transport_tests.rs"]
mod tests;
