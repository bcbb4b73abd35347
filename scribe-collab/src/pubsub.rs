//! Named-channel publish/subscribe gateway over a managed signaling
//! connection.
//!
//! Architecture:
//! ```text
//! subscribe(channel, event, sink)
//!        │
//!        ▼
//! ┌──────────────┐  0→1: connect   ┌──────────────────┐
//! │ PubSubGateway│ ───────────────►│ SignalConnection │
//! │ (refcounted) │  1→0: teardown  │ (ws or in-proc)  │
//! └──────┬───────┘  after grace    └────────┬─────────┘
//!        │                                  │
//!        │ (channel, event) dispatch        │ inbound events
//!        ▼                                  ▼
//!   mpsc sinks  ◄────────────── pump task ──┘
//! ```
//!
//! The gateway is a process-wide shared resource: one connection serves
//! every subscriber, channels are shared across independent subscriptions,
//! and the connection is torn down only when the last subscription anywhere
//! is released. A short grace delay absorbs immediate resubscription
//! without reconnect churn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One delivered channel event.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
}

/// Pub/sub gateway errors.
#[derive(Debug, Clone)]
pub enum PubSubError {
    /// The signaling transport could not establish within its handshake
    /// window. Surfaced to the subscriber, never retried silently.
    Connection(String),
    /// The transport refused a channel subscription.
    Channel(String),
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Signaling connection error: {e}"),
            Self::Channel(e) => write!(f, "Channel subscription error: {e}"),
        }
    }
}

impl std::error::Error for PubSubError {}

/// Normalize a channel name to the transport's allowed character set.
pub fn normalize_channel(name: &str) -> String {
    name.replace('/', ".")
}

/// An established signaling connection.
#[async_trait]
pub trait SignalConnection: Send + Sync {
    /// Subscribe the connection to a (normalized) channel.
    async fn open_channel(&self, channel: &str) -> Result<(), PubSubError>;

    /// Unsubscribe from a channel.
    async fn close_channel(&self, channel: &str);

    /// Take the inbound event stream (single use).
    fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<SignalEvent>>;

    /// Tear the connection down. Infallible.
    fn shutdown(&self);
}

/// Factory establishing signaling connections on demand.
#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SignalConnection>, PubSubError>;
}

/// Gateway tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a fully-unsubscribed connection lingers before teardown.
    pub teardown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            teardown_grace: Duration::from_millis(50),
        }
    }
}

struct Binding {
    id: u64,
    sink: mpsc::UnboundedSender<SignalEvent>,
}

type BindingMap = HashMap<(String, String), Vec<Binding>>;

struct LinkState {
    conn: Option<Box<dyn SignalConnection>>,
    /// Live subscription count per open channel.
    channel_refs: HashMap<String, usize>,
    /// Live subscriptions across all channels.
    total: usize,
    /// Bumped on every subscribe; a pending teardown fires only if the
    /// epoch it captured is still current.
    epoch: u64,
    pump: Option<JoinHandle<()>>,
}

struct GatewayInner {
    connector: Box<dyn SignalConnector>,
    config: GatewayConfig,
    link: tokio::sync::Mutex<LinkState>,
    bindings: Arc<Mutex<BindingMap>>,
    next_binding_id: AtomicU64,
}

/// Reference-counted pub/sub gateway.
///
/// Cheaply clonable; all clones share one connection and one subscription
/// count.
#[derive(Clone)]
pub struct PubSubGateway {
    inner: Arc<GatewayInner>,
}

impl PubSubGateway {
    pub fn new(connector: impl SignalConnector + 'static) -> Self {
        Self::with_config(connector, GatewayConfig::default())
    }

    pub fn with_config(connector: impl SignalConnector + 'static, config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                connector: Box::new(connector),
                config,
                link: tokio::sync::Mutex::new(LinkState {
                    conn: None,
                    channel_refs: HashMap::new(),
                    total: 0,
                    epoch: 0,
                    pump: None,
                }),
                bindings: Arc::new(Mutex::new(HashMap::new())),
                next_binding_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind `sink` to `event` on `channel`.
    ///
    /// Lazily establishes the signaling connection on the first live
    /// subscription and subscribes the channel on its first binding.
    /// Connection failures are surfaced to the caller — whether the session
    /// is still viable is the caller's decision.
    pub async fn subscribe(
        &self,
        channel: &str,
        event: &str,
        sink: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<Subscription, PubSubError> {
        let channel = normalize_channel(channel);
        let inner = &self.inner;
        let mut link = inner.link.lock().await;

        // Any pending grace-delay teardown is now stale.
        link.epoch += 1;

        if link.conn.is_none() {
            let mut conn = inner.connector.connect().await?;
            let incoming = conn
                .take_incoming()
                .ok_or_else(|| PubSubError::Connection("transport yielded no event stream".into()))?;
            link.pump = Some(spawn_dispatch(incoming, inner.bindings.clone()));
            link.conn = Some(conn);
            log::info!("PubSub: signaling connection established");
        }

        if !link.channel_refs.contains_key(&channel) {
            let opened = link.conn.as_ref().unwrap().open_channel(&channel).await;
            if let Err(e) = opened {
                if link.total == 0 {
                    teardown(&mut link);
                }
                return Err(e);
            }
            log::debug!("PubSub: channel {channel} opened");
        }
        *link.channel_refs.entry(channel.clone()).or_insert(0) += 1;
        link.total += 1;
        drop(link);

        let id = inner.next_binding_id.fetch_add(1, Ordering::Relaxed);
        inner
            .bindings
            .lock()
            .unwrap()
            .entry((channel.clone(), event.to_string()))
            .or_default()
            .push(Binding { id, sink });

        Ok(Subscription {
            inner: inner.clone(),
            channel,
            event: event.to_string(),
            id,
            disposed: false,
        })
    }

    /// Live subscriptions across all channels.
    pub async fn subscription_count(&self) -> usize {
        self.inner.link.lock().await.total
    }

    /// Whether the underlying signaling connection is currently up.
    pub async fn is_connected(&self) -> bool {
        self.inner.link.lock().await.conn.is_some()
    }
}

fn spawn_dispatch(
    mut incoming: mpsc::UnboundedReceiver<SignalEvent>,
    bindings: Arc<Mutex<BindingMap>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = incoming.recv().await {
            let key = (event.channel.clone(), event.event.clone());
            let mut map = bindings.lock().unwrap();
            if let Some(bound) = map.get_mut(&key) {
                bound.retain(|binding| binding.sink.send(event.clone()).is_ok());
            }
        }
    })
}

fn teardown(link: &mut LinkState) {
    if let Some(conn) = link.conn.take() {
        conn.shutdown();
    }
    if let Some(pump) = link.pump.take() {
        pump.abort();
    }
    link.channel_refs.clear();
}

async fn release(inner: Arc<GatewayInner>, channel: String) {
    let mut link = inner.link.lock().await;

    if let Some(refs) = link.channel_refs.get_mut(&channel) {
        *refs -= 1;
        if *refs == 0 {
            link.channel_refs.remove(&channel);
            if let Some(conn) = link.conn.as_ref() {
                conn.close_channel(&channel).await;
                log::debug!("PubSub: channel {channel} closed");
            }
        }
    }
    link.total = link.total.saturating_sub(1);

    if link.total == 0 && link.conn.is_some() {
        let epoch = link.epoch;
        let grace = inner.config.teardown_grace;
        drop(link);
        tokio::time::sleep(grace).await;

        let mut link = inner.link.lock().await;
        if link.epoch == epoch && link.total == 0 {
            teardown(&mut link);
            log::info!("PubSub: signaling connection released");
        }
    }
}

/// One live (channel, event) binding.
///
/// Disposal unbinds the sink and, if it was the last subscription anywhere,
/// releases the signaling connection after the grace delay. Dropping the
/// handle disposes it.
pub struct Subscription {
    inner: Arc<GatewayInner>,
    channel: String,
    event: String,
    id: u64,
    disposed: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Unbind the sink. Idempotent; never fails.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let key = (self.channel.clone(), self.event.clone());
        let mut map = self.inner.bindings.lock().unwrap();
        if let Some(bound) = map.get_mut(&key) {
            bound.retain(|binding| binding.id != self.id);
            if bound.is_empty() {
                map.remove(&key);
            }
        }
        drop(map);

        // Refcount bookkeeping needs the link lock; run it off-handle so
        // dispose stays synchronous.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(release(self.inner.clone(), self.channel.clone()));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
