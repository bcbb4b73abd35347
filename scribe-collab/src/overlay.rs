//! Star-topology overlay network over the peer pool.
//!
//! Architecture:
//! ```text
//!            ┌─────────┐
//!            │  Spoke  │
//!            └────┬────┘
//!                 │ RelayUnicast / RelayBroadcast
//!                 ▼
//! ┌─────────┐  ┌─────────┐  ┌─────────┐
//! │  Spoke  │◄─┤   Hub   ├─►│  Spoke  │   Direct (sender preserved)
//! └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! One hub holds a direct connection to every member; spokes hold a single
//! connection to the hub and reach each other through relay. The hub
//! restores the original sender identity when forwarding, never its own.
//! Many networks multiplex over the same pool connections; each
//! [`StarNetwork`] filters inbound frames by its network id.
//!
//! Routing failures (unknown target, non-member, no hub yet) drop the
//! message without error — best-effort semantics, no retry or buffering.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::{InboundFrame, PeerPool, PoolError};
use crate::protocol::{Envelope, EnvelopeKind, NetworkId, PeerId};

/// Role of the local peer within one overlay network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    /// Holds direct connections to all members; relays spoke traffic.
    Hub,
    /// Reaches other members through the hub.
    Spoke,
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// An application message from another member. `sender` is always the
    /// original sender, even when the message was relayed by the hub.
    Message { sender: PeerId, payload: Vec<u8> },
}

/// Overlay network errors.
#[derive(Debug)]
pub enum OverlayError {
    /// `connect_to` is a spoke operation; the hub has no hub of its own.
    NotASpoke,
    Pool(PoolError),
}

impl std::fmt::Display for OverlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotASpoke => write!(f, "Only a spoke can connect to a hub"),
            Self::Pool(e) => write!(f, "Overlay connect failed: {e}"),
        }
    }
}

impl std::error::Error for OverlayError {}

impl From<PoolError> for OverlayError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

struct NetworkInner {
    network_id: NetworkId,
    local_peer: PeerId,
    role: NetworkRole,
    pool: Arc<dyn PeerPool>,
    /// Hub peer id; spokes only, set by `connect_to`.
    hub: Mutex<Option<PeerId>>,
    /// Member set; hub only, grows via join. The hub itself is not a member.
    members: Mutex<HashSet<PeerId>>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    disposed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// One member's view of a star overlay network.
///
/// Owned exclusively by the local process; one instance per
/// (network id, local peer) pair. All inbound pool traffic for the instance
/// is serialized on a single pump task, so membership mutation never races.
/// Construction spawns the pump and therefore requires a tokio runtime.
pub struct StarNetwork {
    inner: Arc<NetworkInner>,
    event_rx: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
}

impl StarNetwork {
    /// Create the hub of a network. Members accrue as peers join.
    pub fn hub(network_id: impl Into<NetworkId>, pool: Arc<dyn PeerPool>) -> Self {
        Self::with_role(network_id.into(), pool, NetworkRole::Hub)
    }

    /// Create a spoke. It becomes a member once [`connect_to`](Self::connect_to)
    /// resolves; until then its traffic is not deliverable.
    pub fn spoke(network_id: impl Into<NetworkId>, pool: Arc<dyn PeerPool>) -> Self {
        Self::with_role(network_id.into(), pool, NetworkRole::Spoke)
    }

    fn with_role(network_id: NetworkId, pool: Arc<dyn PeerPool>, role: NetworkRole) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(NetworkInner {
            network_id,
            local_peer: pool.local_peer().clone(),
            role,
            pool: pool.clone(),
            hub: Mutex::new(None),
            members: Mutex::new(HashSet::new()),
            event_tx,
            disposed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let mut frames = pool.attach();
        let pump_inner = inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                pump_inner.handle_frame(frame);
            }
        });
        *inner.pump.lock().unwrap() = Some(handle);

        Self {
            inner,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.event_rx.take()
    }

    /// Connect this spoke to its hub and join the network.
    ///
    /// Ensures a pool connection to the hub exists, then announces
    /// membership. Resolves only once the spoke is a member; a no-op after
    /// disposal.
    pub async fn connect_to(&self, hub: impl Into<PeerId>) -> Result<(), OverlayError> {
        if self.inner.role != NetworkRole::Spoke {
            return Err(OverlayError::NotASpoke);
        }
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let hub = hub.into();
        self.inner.pool.connect_to(&hub).await?;

        // Disposal may have begun while the connect was in flight.
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        *self.inner.hub.lock().unwrap() = Some(hub.clone());

        let join = Envelope::join(self.inner.network_id.clone(), self.inner.local_peer.clone());
        self.inner.send_envelope(&hub, &join);
        log::info!(
            "Overlay {}: {} joined via hub {}",
            self.inner.network_id,
            self.inner.local_peer,
            hub
        );
        Ok(())
    }

    /// Send `payload` to exactly one other member.
    ///
    /// Fire-and-forget: unknown targets and non-members are dropped
    /// silently.
    pub fn unicast(&self, target: impl Into<PeerId>, payload: impl Into<Vec<u8>>) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let target = target.into();
        let payload = payload.into();
        let inner = &self.inner;

        match inner.role {
            NetworkRole::Hub => {
                if inner.members.lock().unwrap().contains(&target) {
                    let envelope = Envelope::direct(
                        inner.network_id.clone(),
                        inner.local_peer.clone(),
                        payload,
                    );
                    inner.send_envelope(&target, &envelope);
                } else {
                    log::debug!(
                        "Overlay {}: dropping unicast to non-member {}",
                        inner.network_id,
                        target
                    );
                }
            }
            NetworkRole::Spoke => {
                let hub = inner.hub.lock().unwrap().clone();
                match hub {
                    Some(hub) => {
                        let envelope = Envelope::relay_unicast(
                            inner.network_id.clone(),
                            inner.local_peer.clone(),
                            target,
                            payload,
                        );
                        inner.send_envelope(&hub, &envelope);
                    }
                    None => log::debug!(
                        "Overlay {}: dropping unicast from {} (no hub yet)",
                        inner.network_id,
                        inner.local_peer
                    ),
                }
            }
        }
    }

    /// Send `payload` to every other member.
    ///
    /// The sender never receives its own broadcast.
    pub fn broadcast(&self, payload: impl Into<Vec<u8>>) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let payload = payload.into();
        let inner = &self.inner;

        match inner.role {
            NetworkRole::Hub => {
                let envelope = Envelope::direct(
                    inner.network_id.clone(),
                    inner.local_peer.clone(),
                    payload,
                );
                let members = inner.members.lock().unwrap().clone();
                for member in &members {
                    inner.send_envelope(member, &envelope);
                }
            }
            NetworkRole::Spoke => {
                let hub = inner.hub.lock().unwrap().clone();
                match hub {
                    Some(hub) => {
                        let envelope = Envelope::relay_broadcast(
                            inner.network_id.clone(),
                            inner.local_peer.clone(),
                            payload,
                        );
                        inner.send_envelope(&hub, &envelope);
                    }
                    None => log::debug!(
                        "Overlay {}: dropping broadcast from {} (no hub yet)",
                        inner.network_id,
                        inner.local_peer
                    ),
                }
            }
        }
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.inner.network_id
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn role(&self) -> NetworkRole {
        self.inner.role
    }

    /// Current members as seen by the hub (always empty on a spoke).
    pub fn members(&self) -> Vec<PeerId> {
        self.inner.members.lock().unwrap().iter().cloned().collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop processing inbound traffic. Idempotent; subsequent unicast,
    /// broadcast and connect calls become no-ops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.inner.pump.lock().unwrap().take() {
            pump.abort();
        }
        log::debug!(
            "Overlay {}: {} disposed",
            self.inner.network_id,
            self.inner.local_peer
        );
    }
}

impl Drop for StarNetwork {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl NetworkInner {
    fn send_envelope(&self, to: &PeerId, envelope: &Envelope) {
        match envelope.encode() {
            Ok(bytes) => self.pool.send(to, bytes),
            Err(e) => log::error!("Overlay {}: {e}", self.network_id),
        }
    }

    /// Handle one inbound pool frame. Runs on the pump task only.
    fn handle_frame(&self, frame: InboundFrame) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let envelope = match Envelope::decode(&frame.payload) {
            Ok(envelope) => envelope,
            // Frames for other protocols share the pool; not ours to parse.
            Err(_) => return,
        };
        if envelope.network_id != self.network_id {
            return;
        }

        // Membership upsert: any envelope for this network from a connected
        // peer makes that peer a member.
        if self.role == NetworkRole::Hub {
            let mut members = self.members.lock().unwrap();
            if members.insert(frame.sender.clone()) {
                log::info!(
                    "Overlay {}: hub {} added member {}",
                    self.network_id,
                    self.local_peer,
                    frame.sender
                );
            }
        }

        match envelope.kind {
            EnvelopeKind::Join => {}
            EnvelopeKind::Direct => self.emit(envelope.original_sender, envelope.payload),
            EnvelopeKind::RelayUnicast { ref target } => {
                if self.role != NetworkRole::Hub {
                    log::debug!("Overlay {}: spoke ignoring relay request", self.network_id);
                    return;
                }
                if *target == self.local_peer {
                    // Spoke addressed the hub itself.
                    self.emit(envelope.original_sender, envelope.payload);
                } else if self.members.lock().unwrap().contains(target) {
                    let forward = Envelope::direct(
                        self.network_id.clone(),
                        envelope.original_sender,
                        envelope.payload,
                    );
                    self.send_envelope(target, &forward);
                } else {
                    log::debug!(
                        "Overlay {}: dropping relay to non-member {}",
                        self.network_id,
                        target
                    );
                }
            }
            EnvelopeKind::RelayBroadcast => {
                if self.role != NetworkRole::Hub {
                    log::debug!("Overlay {}: spoke ignoring relay request", self.network_id);
                    return;
                }
                let sender = envelope.original_sender;
                let forward =
                    Envelope::direct(self.network_id.clone(), sender.clone(), envelope.payload);
                let members = self.members.lock().unwrap().clone();
                for member in members.iter().filter(|m| **m != sender) {
                    self.send_envelope(member, &forward);
                }
                // The hub is itself a broadcast recipient.
                self.emit(forward.original_sender, forward.payload);
            }
        }
    }

    fn emit(&self, sender: PeerId, payload: Vec<u8>) {
        let _ = self.event_tx.send(NetworkEvent::Message { sender, payload });
    }
}
