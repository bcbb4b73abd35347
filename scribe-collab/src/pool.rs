//! Direct peer-to-peer connection pool boundary.
//!
//! The pool owns addressable point-to-point connections between peer
//! identities. Connection establishment, NAT traversal and encryption live
//! behind the [`PeerPool`] trait; this crate only relies on the contract:
//! `connect_to` resolves once a direct connection exists, `send` is
//! fire-and-forget, and inbound frames fan out to every attached listener.
//!
//! [`MemoryExchange`] is the in-process implementation used by
//! single-machine sessions and the integration tests: one exchange routes
//! frames between all pools registered on it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::PeerId;

/// One inbound frame delivered by the pool.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub sender: PeerId,
    pub payload: Vec<u8>,
}

/// Connection pool errors.
///
/// Only connection establishment can fail; `send` is best-effort and drops
/// silently when the destination is unknown or unlinked.
#[derive(Debug, Clone)]
pub enum PoolError {
    UnknownPeer(PeerId),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPeer(peer) => write!(f, "No route to peer {peer}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Direct connections between peer identities.
///
/// One pool instance per local peer. The same physical connection between
/// two peers is shared by every overlay network that spans them; `connect_to`
/// is idempotent per peer pair.
#[async_trait]
pub trait PeerPool: Send + Sync {
    /// The local peer this pool speaks for.
    fn local_peer(&self) -> &PeerId;

    /// Ensure a direct connection to `peer` exists, establishing one if
    /// absent. Resolves once the connection is usable.
    async fn connect_to(&self, peer: &PeerId) -> Result<(), PoolError>;

    /// Send raw bytes to a directly-connected peer.
    ///
    /// Messages to peers with no open connection are dropped without error.
    fn send(&self, peer: &PeerId, payload: Vec<u8>);

    /// Attach a listener receiving every inbound frame addressed to the
    /// local peer. Multiple listeners each receive their own copy.
    fn attach(&self) -> mpsc::UnboundedReceiver<InboundFrame>;
}

struct PeerSlot {
    taps: Vec<mpsc::UnboundedSender<InboundFrame>>,
}

struct ExchangeInner {
    peers: Mutex<HashMap<PeerId, PeerSlot>>,
    /// Open connections, keyed by ordered peer pair.
    links: Mutex<HashSet<(PeerId, PeerId)>>,
}

/// In-process switchboard routing frames between registered pools.
///
/// Cheaply clonable handle over shared state.
#[derive(Clone)]
pub struct MemoryExchange {
    inner: Arc<ExchangeInner>,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                peers: Mutex::new(HashMap::new()),
                links: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register a peer on this exchange and return its pool handle.
    pub fn register(&self, peer: impl Into<PeerId>) -> MemoryPeerPool {
        let peer = peer.into();
        self.inner
            .peers
            .lock()
            .unwrap()
            .insert(peer.clone(), PeerSlot { taps: Vec::new() });
        MemoryPeerPool {
            exchange: self.clone(),
            local: peer,
        }
    }

    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.inner.links.lock().unwrap().contains(&link_key(a, b))
    }

    fn link(&self, a: &PeerId, b: &PeerId) {
        self.inner.links.lock().unwrap().insert(link_key(a, b));
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) {
        let mut peers = self.inner.peers.lock().unwrap();
        if let Some(slot) = peers.get_mut(to) {
            // Drop taps whose receiver side has gone away.
            slot.taps.retain(|tap| {
                tap.send(InboundFrame {
                    sender: from.clone(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
    }
}

impl Default for MemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a.as_str() <= b.as_str() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Peer pool backed by a [`MemoryExchange`].
#[derive(Clone)]
pub struct MemoryPeerPool {
    exchange: MemoryExchange,
    local: PeerId,
}

#[async_trait]
impl PeerPool for MemoryPeerPool {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    async fn connect_to(&self, peer: &PeerId) -> Result<(), PoolError> {
        let known = self
            .exchange
            .inner
            .peers
            .lock()
            .unwrap()
            .contains_key(peer);
        if !known {
            return Err(PoolError::UnknownPeer(peer.clone()));
        }
        self.exchange.link(&self.local, peer);
        log::debug!("Pool: {} connected to {}", self.local, peer);
        Ok(())
    }

    fn send(&self, peer: &PeerId, payload: Vec<u8>) {
        if !self.exchange.linked(&self.local, peer) {
            log::debug!("Pool: dropping frame {} -> {} (no open connection)", self.local, peer);
            return;
        }
        self.exchange.deliver(&self.local, peer, payload);
    }

    fn attach(&self) -> mpsc::UnboundedReceiver<InboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.exchange.inner.peers.lock().unwrap();
        if let Some(slot) = peers.get_mut(&self.local) {
            slot.taps.push(tx);
        }
        rx
    }
}
