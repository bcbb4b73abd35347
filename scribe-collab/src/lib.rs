//! # scribe-collab — Session and overlay messaging layer for Scribe
//!
//! Lets multiple sites share documents through a portal hosted by one site
//! and joined by others: a star-topology overlay network for peer
//! messaging, plus the portal state machines that coordinate join/leave,
//! active-document handoff and disconnect propagation over pub/sub.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   subscribe    ┌───────────────┐   ws / in-proc
//! │  Portal    │ ──────────────►│ PubSubGateway │ ◄───────────────► signaling
//! │ host/guest │                └───────────────┘
//! └─────┬──────┘
//!       │ Heartbeat (liveness keepalive)
//!       ▼
//! ┌────────────┐
//! │ResourceApi │  portal/site allocation, active-editor handoff
//! └────────────┘
//!
//! ┌─────────────┐   unicast/broadcast   ┌──────────┐
//! │ StarNetwork │ ─────────────────────►│ PeerPool │  direct connections
//! │ hub/spoke   │   (hub relays,        └──────────┘
//! └─────────────┘    sender preserved)
//! ```
//!
//! The two messaging paths are independent: the gateway is channel/topic
//! based and server-mediated; the overlay is peer-direct with hub relay.
//!
//! ## Modules
//!
//! - [`protocol`] — Identity types and the binary overlay envelope
//! - [`pool`] — Direct peer connection boundary + in-process exchange
//! - [`overlay`] — Star-topology overlay network (hub relay, membership)
//! - [`pubsub`] — Reference-counted pub/sub gateway over signaling
//! - [`socket`] — WebSocket signaling transport
//! - [`resource`] — Portal/site metadata service boundary
//! - [`heartbeat`] — Per-site liveness keepalive
//! - [`portal`] — Host/guest session state machines
//! - [`local`] — In-process backends for single-machine sessions and tests

pub mod heartbeat;
pub mod local;
pub mod overlay;
pub mod pool;
pub mod portal;
pub mod protocol;
pub mod pubsub;
pub mod resource;
pub mod socket;

// Re-exports for convenience
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use local::{LocalEditor, LocalEditors, LocalPortalService, LocalSignalBus};
pub use overlay::{NetworkEvent, NetworkRole, OverlayError, StarNetwork};
pub use pool::{InboundFrame, MemoryExchange, MemoryPeerPool, PeerPool, PoolError};
pub use portal::{
    EditorError, EditorRegistry, GuestPortal, HostPortal, PortalDelegate, PortalError,
    PortalPhase, SharedEditor,
};
pub use protocol::{
    EditorId, Envelope, EnvelopeKind, NetworkId, PeerId, PortalId, SiteId, WireError,
    HOST_SITE_ID,
};
pub use pubsub::{
    GatewayConfig, PubSubError, PubSubGateway, SignalConnection, SignalConnector, SignalEvent,
    Subscription,
};
pub use resource::{portal_channel, JoinRecord, PortalRecord, ResourceApi, ResourceError};
pub use socket::SocketConnector;
