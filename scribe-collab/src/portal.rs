//! Host and guest portal state machines.
//!
//! Architecture:
//! ```text
//! ┌────────────┐ create/join  ┌──────────────┐
//! │ HostPortal │─────────────►│ ResourceApi  │◄── keepalives (Heartbeat)
//! │ GuestPortal│              └──────┬───────┘
//! └─────┬──────┘                     │ fans out
//!       │ subscribe                  ▼
//!       │            ┌───────────────────────────────┐
//!       └───────────►│ /portals/{id}                 │
//!                    │   update          (handoff)   │
//!                    │   disconnect-site (liveness)  │
//!                    └───────────────────────────────┘
//! ```
//!
//! A portal moves `Uninitialized → Active → Disposed`; disposal is terminal
//! and idempotent. Each portal pumps its channel events on one task, so
//! state mutation never races; anything arriving after disposal began is
//! ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::protocol::{EditorId, PortalId, SiteId, HOST_SITE_ID};
use crate::pubsub::{PubSubError, PubSubGateway, SignalEvent, Subscription};
use crate::resource::{portal_channel, ResourceApi, ResourceError};

/// Callbacks exposed to the embedding application.
pub trait PortalDelegate: Send + Sync {
    /// The portal's active shared editor changed (possibly to none).
    fn set_active_shared_editor(&self, editor: Option<Arc<dyn SharedEditor>>);

    /// The host left; the session is unrecoverable and has auto-disposed.
    fn host_did_disconnect(&self);
}

/// One shared document, owned by the editor subsystem.
pub trait SharedEditor: Send + Sync {
    fn id(&self) -> EditorId;

    /// Evict a departed site's transient state (cursors, selections).
    fn site_did_disconnect(&self, site_id: SiteId);
}

/// Shared-editor subsystem boundary.
#[async_trait]
pub trait EditorRegistry: Send + Sync {
    async fn create_editor(&self) -> Result<Arc<dyn SharedEditor>, EditorError>;
    async fn join_editor(&self, id: EditorId) -> Result<Arc<dyn SharedEditor>, EditorError>;
}

/// Editor subsystem errors.
#[derive(Debug, Clone)]
pub enum EditorError {
    NotFound(EditorId),
}

impl std::fmt::Display for EditorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Shared editor not found: {id}"),
        }
    }
}

impl std::error::Error for EditorError {}

/// Portal lifecycle errors.
#[derive(Debug)]
pub enum PortalError {
    /// Operation requires `create()`/`join()` to have completed.
    Uninitialized,
    Resource(ResourceError),
    PubSub(PubSubError),
    Editor(EditorError),
}

impl std::fmt::Display for PortalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Portal is not active yet"),
            Self::Resource(e) => write!(f, "{e}"),
            Self::PubSub(e) => write!(f, "{e}"),
            Self::Editor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PortalError {}

impl From<ResourceError> for PortalError {
    fn from(e: ResourceError) -> Self {
        Self::Resource(e)
    }
}

impl From<PubSubError> for PortalError {
    fn from(e: PubSubError) -> Self {
        Self::PubSub(e)
    }
}

impl From<EditorError> for PortalError {
    fn from(e: EditorError) -> Self {
        Self::Editor(e)
    }
}

/// Portal lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalPhase {
    Uninitialized,
    Active,
    Disposed,
}

/// Lifecycle state shared between a portal and its event pump.
struct SessionCore {
    disposed: AtomicBool,
    heartbeat: Mutex<Option<Arc<Heartbeat>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            disposed: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Terminal teardown: heartbeat first, then every subscription.
    /// Idempotent and infallible.
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(heartbeat) = self.heartbeat.lock().unwrap().take() {
            heartbeat.dispose();
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        for subscription in subscriptions.iter_mut() {
            subscription.dispose();
        }
        subscriptions.clear();
        drop(subscriptions);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }

    /// Abrupt liveness failure: kill the heartbeat, leave subscriptions
    /// untouched.
    fn simulate_network_failure(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().unwrap().as_ref() {
            heartbeat.dispose();
        }
    }

    // The adopt_* helpers guard against disposal racing an in-flight
    // create/join: anything acquired after disposal began is released on
    // the spot instead of being stored in released state.

    fn adopt_heartbeat(&self, heartbeat: Arc<Heartbeat>) {
        let mut slot = self.heartbeat.lock().unwrap();
        if self.is_disposed() {
            heartbeat.dispose();
            return;
        }
        heartbeat.start();
        *slot = Some(heartbeat);
    }

    fn adopt_subscriptions(&self, subscriptions: impl IntoIterator<Item = Subscription>) {
        let mut held = self.subscriptions.lock().unwrap();
        if self.is_disposed() {
            drop(held);
            for mut subscription in subscriptions {
                subscription.dispose();
            }
            return;
        }
        held.extend(subscriptions);
    }

    fn adopt_pump(&self, handle: JoinHandle<()>) {
        let mut slot = self.pump.lock().unwrap();
        if self.is_disposed() {
            handle.abort();
            return;
        }
        *slot = Some(handle);
    }
}

fn parse_site_id(payload: &serde_json::Value) -> Option<SiteId> {
    payload.get("siteId")?.as_str()?.parse().ok()
}

fn parse_editor_id(payload: &serde_json::Value) -> Option<EditorId> {
    payload
        .get("activeEditorId")?
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
}

// ───────────────────────────────────────────────────────────────────
// Host portal
// ───────────────────────────────────────────────────────────────────

struct HostShared {
    core: SessionCore,
    active: Mutex<Option<Arc<dyn SharedEditor>>>,
}

/// The hosting side of a collaborative session.
pub struct HostPortal {
    resource: Arc<dyn ResourceApi>,
    gateway: PubSubGateway,
    editors: Arc<dyn EditorRegistry>,
    heartbeat_config: HeartbeatConfig,
    id: Option<PortalId>,
    shared: Arc<HostShared>,
}

impl HostPortal {
    pub fn new(
        resource: Arc<dyn ResourceApi>,
        gateway: PubSubGateway,
        editors: Arc<dyn EditorRegistry>,
        heartbeat_config: HeartbeatConfig,
    ) -> Self {
        Self {
            resource,
            gateway,
            editors,
            heartbeat_config,
            id: None,
            shared: Arc::new(HostShared {
                core: SessionCore::new(),
                active: Mutex::new(None),
            }),
        }
    }

    /// Register the portal, claim the reserved host site, subscribe to
    /// disconnect events and start the heartbeat.
    pub async fn create(&mut self) -> Result<PortalId, PortalError> {
        let record = self.resource.create_portal().await?;
        self.id = Some(record.id);

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .gateway
            .subscribe(&portal_channel(record.id), "disconnect-site", tx)
            .await?;
        self.shared.core.adopt_subscriptions([subscription]);

        let shared = self.shared.clone();
        self.shared
            .core
            .adopt_pump(tokio::spawn(host_pump(rx, shared)));

        self.shared.core.adopt_heartbeat(Arc::new(Heartbeat::new(
            self.resource.clone(),
            record.id,
            HOST_SITE_ID,
            self.heartbeat_config.clone(),
        )));

        log::info!("Portal {}: hosting as site {HOST_SITE_ID}", record.id);
        Ok(record.id)
    }

    /// Create a shared editor in this portal's editor subsystem.
    pub async fn create_shared_editor(&self) -> Result<Arc<dyn SharedEditor>, PortalError> {
        Ok(self.editors.create_editor().await?)
    }

    /// Hand the active document off to every guest (or clear it with
    /// `None`). A no-op once disposed.
    pub async fn set_active_shared_editor(
        &self,
        editor: Option<Arc<dyn SharedEditor>>,
    ) -> Result<(), PortalError> {
        if self.shared.core.is_disposed() {
            return Ok(());
        }
        let id = self.id.ok_or(PortalError::Uninitialized)?;

        *self.shared.active.lock().unwrap() = editor.clone();
        self.resource
            .set_active_editor(id, editor.map(|e| e.id()))
            .await?;
        Ok(())
    }

    pub fn id(&self) -> Option<PortalId> {
        self.id
    }

    pub fn site_id(&self) -> SiteId {
        HOST_SITE_ID
    }

    pub fn active_shared_editor(&self) -> Option<Arc<dyn SharedEditor>> {
        self.shared.active.lock().unwrap().clone()
    }

    pub fn phase(&self) -> PortalPhase {
        if self.shared.core.is_disposed() {
            PortalPhase::Disposed
        } else if self.id.is_some() {
            PortalPhase::Active
        } else {
            PortalPhase::Uninitialized
        }
    }

    /// Abruptly kill the liveness heartbeat, leaving subscriptions intact.
    pub fn simulate_network_failure(&self) {
        self.shared.core.simulate_network_failure();
    }

    pub fn dispose(&self) {
        self.shared.core.dispose();
    }
}

impl Drop for HostPortal {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn host_pump(mut rx: mpsc::UnboundedReceiver<SignalEvent>, shared: Arc<HostShared>) {
    while let Some(event) = rx.recv().await {
        if shared.core.is_disposed() {
            break;
        }
        if event.event != "disconnect-site" {
            continue;
        }
        let Some(site_id) = parse_site_id(&event.payload) else {
            log::warn!("Portal: undecodable disconnect-site payload");
            continue;
        };
        log::info!("Portal: site {site_id} disconnected");
        let active = shared.active.lock().unwrap().clone();
        if let Some(editor) = active {
            editor.site_did_disconnect(site_id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Guest portal
// ───────────────────────────────────────────────────────────────────

struct GuestShared {
    core: SessionCore,
    portal_id: PortalId,
    editors: Arc<dyn EditorRegistry>,
    site_id: Mutex<Option<SiteId>>,
    active: Mutex<Option<Arc<dyn SharedEditor>>>,
    delegate: Mutex<Option<Arc<dyn PortalDelegate>>>,
}

impl GuestShared {
    fn notify_active(&self, editor: Option<Arc<dyn SharedEditor>>) {
        let delegate = self.delegate.lock().unwrap().clone();
        if let Some(delegate) = delegate {
            delegate.set_active_shared_editor(editor);
        }
    }
}

/// The joining side of a collaborative session.
pub struct GuestPortal {
    resource: Arc<dyn ResourceApi>,
    gateway: PubSubGateway,
    heartbeat_config: HeartbeatConfig,
    shared: Arc<GuestShared>,
}

impl GuestPortal {
    pub fn new(
        id: PortalId,
        resource: Arc<dyn ResourceApi>,
        gateway: PubSubGateway,
        editors: Arc<dyn EditorRegistry>,
        heartbeat_config: HeartbeatConfig,
    ) -> Self {
        Self {
            resource,
            gateway,
            heartbeat_config,
            shared: Arc::new(GuestShared {
                core: SessionCore::new(),
                portal_id: id,
                editors,
                site_id: Mutex::new(None),
                active: Mutex::new(None),
                delegate: Mutex::new(None),
            }),
        }
    }

    /// Register the application-facing delegate.
    ///
    /// If an active editor is already known it is announced immediately.
    pub fn set_delegate(&self, delegate: Arc<dyn PortalDelegate>) {
        *self.shared.delegate.lock().unwrap() = Some(delegate.clone());
        let active = self.shared.active.lock().unwrap().clone();
        if let Some(editor) = active {
            delegate.set_active_shared_editor(Some(editor));
        }
    }

    /// Obtain a site assignment, start the heartbeat, subscribe to portal
    /// events, and join the currently active editor (if any) before
    /// resolving.
    pub async fn join(&self) -> Result<(), PortalError> {
        if self.shared.core.is_disposed() {
            return Ok(());
        }
        let portal_id = self.shared.portal_id;
        let record = self.resource.join_portal(portal_id).await?;
        *self.shared.site_id.lock().unwrap() = Some(record.site_id);

        self.shared.core.adopt_heartbeat(Arc::new(Heartbeat::new(
            self.resource.clone(),
            portal_id,
            record.site_id,
            self.heartbeat_config.clone(),
        )));

        let channel = portal_channel(portal_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = [
            self.gateway.subscribe(&channel, "update", tx.clone()).await?,
            self.gateway
                .subscribe(&channel, "disconnect-site", tx)
                .await?,
        ];
        self.shared.core.adopt_subscriptions(subscriptions);

        let shared = self.shared.clone();
        self.shared
            .core
            .adopt_pump(tokio::spawn(guest_pump(rx, shared)));

        if let Some(editor_id) = record.active_editor_id {
            let editor = self.shared.editors.join_editor(editor_id).await?;
            // Disposal may have begun while the join was in flight.
            if !self.shared.core.is_disposed() {
                *self.shared.active.lock().unwrap() = Some(editor);
            }
        }

        log::info!("Portal {portal_id}: joined as site {}", record.site_id);
        Ok(())
    }

    pub fn portal_id(&self) -> PortalId {
        self.shared.portal_id
    }

    pub fn site_id(&self) -> Option<SiteId> {
        *self.shared.site_id.lock().unwrap()
    }

    pub fn active_shared_editor(&self) -> Option<Arc<dyn SharedEditor>> {
        self.shared.active.lock().unwrap().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.core.is_disposed()
    }

    pub fn phase(&self) -> PortalPhase {
        if self.shared.core.is_disposed() {
            PortalPhase::Disposed
        } else if self.shared.site_id.lock().unwrap().is_some() {
            PortalPhase::Active
        } else {
            PortalPhase::Uninitialized
        }
    }

    /// Abruptly kill the liveness heartbeat, leaving subscriptions intact.
    pub fn simulate_network_failure(&self) {
        self.shared.core.simulate_network_failure();
    }

    pub fn dispose(&self) {
        self.shared.core.dispose();
    }
}

impl Drop for GuestPortal {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn guest_pump(mut rx: mpsc::UnboundedReceiver<SignalEvent>, shared: Arc<GuestShared>) {
    while let Some(event) = rx.recv().await {
        if shared.core.is_disposed() {
            break;
        }
        match event.event.as_str() {
            "update" => {
                let next = match parse_editor_id(&event.payload) {
                    Some(editor_id) => match shared.editors.join_editor(editor_id).await {
                        Ok(editor) => Some(editor),
                        Err(e) => {
                            log::warn!("Portal {}: {e}", shared.portal_id);
                            continue;
                        }
                    },
                    None => None,
                };
                if shared.core.is_disposed() {
                    break;
                }
                *shared.active.lock().unwrap() = next.clone();
                shared.notify_active(next);
            }
            "disconnect-site" => {
                let Some(site_id) = parse_site_id(&event.payload) else {
                    log::warn!("Portal {}: undecodable disconnect-site payload", shared.portal_id);
                    continue;
                };
                log::info!("Portal {}: site {site_id} disconnected", shared.portal_id);
                let active = shared.active.lock().unwrap().clone();
                if let Some(editor) = active {
                    editor.site_did_disconnect(site_id);
                }
                if site_id == HOST_SITE_ID {
                    let delegate = shared.delegate.lock().unwrap().clone();
                    if let Some(delegate) = delegate {
                        delegate.host_did_disconnect();
                    }
                    shared.core.dispose();
                    break;
                }
            }
            other => log::debug!("Portal {}: ignoring event {other}", shared.portal_id),
        }
    }
}
