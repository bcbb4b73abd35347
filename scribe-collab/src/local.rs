//! In-process backends for single-machine sessions and tests.
//!
//! [`LocalSignalBus`] plays the signaling server: connections register the
//! channels they subscribe to and `publish` fans events out to them.
//! [`LocalPortalService`] plays the resource service on top of the bus —
//! it allocates portals, assigns site ids, emits `update` events on
//! active-editor changes and `disconnect-site` events when a site's
//! liveness lapses. [`LocalEditors`] stands in for the shared-document
//! subsystem at its trait boundary.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::portal::{EditorError, EditorRegistry, SharedEditor};
use crate::protocol::{EditorId, PortalId, SiteId};
use crate::pubsub::{
    normalize_channel, PubSubError, SignalConnection, SignalConnector, SignalEvent,
};
use crate::resource::{portal_channel, JoinRecord, PortalRecord, ResourceApi, ResourceError};
use tokio::sync::mpsc;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Signal bus
// ───────────────────────────────────────────────────────────────────

struct ConnSlot {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

struct BusInner {
    conns: Mutex<HashMap<u64, ConnSlot>>,
    next_conn: AtomicU64,
}

/// Process-local pub/sub bus with a publishing side.
#[derive(Clone)]
pub struct LocalSignalBus {
    inner: Arc<BusInner>,
}

impl LocalSignalBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                conns: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Deliver an event to every connection subscribed to `channel`.
    pub fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) {
        let channel = normalize_channel(channel);
        let mut conns = self.inner.conns.lock().unwrap();
        conns.retain(|_, slot| {
            if !slot.channels.contains(&channel) {
                return true;
            }
            slot.tx
                .send(SignalEvent {
                    channel: channel.clone(),
                    event: event.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });
    }

    /// Number of live connections (teardown observability for tests).
    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }
}

impl Default for LocalSignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalConnector for LocalSignalBus {
    async fn connect(&self) -> Result<Box<dyn SignalConnection>, PubSubError> {
        let id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.conns.lock().unwrap().insert(
            id,
            ConnSlot {
                channels: HashSet::new(),
                tx,
            },
        );
        Ok(Box::new(LocalConnection {
            bus: self.clone(),
            id,
            incoming: Some(rx),
        }))
    }
}

struct LocalConnection {
    bus: LocalSignalBus,
    id: u64,
    incoming: Option<mpsc::UnboundedReceiver<SignalEvent>>,
}

#[async_trait]
impl SignalConnection for LocalConnection {
    async fn open_channel(&self, channel: &str) -> Result<(), PubSubError> {
        let mut conns = self.bus.inner.conns.lock().unwrap();
        match conns.get_mut(&self.id) {
            Some(slot) => {
                slot.channels.insert(channel.to_string());
                Ok(())
            }
            None => Err(PubSubError::Channel("connection gone".into())),
        }
    }

    async fn close_channel(&self, channel: &str) {
        let mut conns = self.bus.inner.conns.lock().unwrap();
        if let Some(slot) = conns.get_mut(&self.id) {
            slot.channels.remove(channel);
        }
    }

    fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.incoming.take()
    }

    fn shutdown(&self) {
        self.bus.inner.conns.lock().unwrap().remove(&self.id);
    }
}

// ───────────────────────────────────────────────────────────────────
// Portal service
// ───────────────────────────────────────────────────────────────────

struct PortalSlot {
    next_site: SiteId,
    active_editor: Option<EditorId>,
    keepalives: HashMap<SiteId, u64>,
}

struct ServiceInner {
    bus: LocalSignalBus,
    portals: Mutex<HashMap<PortalId, PortalSlot>>,
}

/// In-process portal/site resource service.
#[derive(Clone)]
pub struct LocalPortalService {
    inner: Arc<ServiceInner>,
}

impl LocalPortalService {
    pub fn new(bus: LocalSignalBus) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                bus,
                portals: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &LocalSignalBus {
        &self.inner.bus
    }

    /// Announce that a site's liveness lapsed, exactly as the production
    /// server does when keepalives stop arriving.
    pub fn expire_site(&self, portal_id: PortalId, site_id: SiteId) {
        self.inner.bus.publish(
            &portal_channel(portal_id),
            "disconnect-site",
            serde_json::json!({ "siteId": site_id.to_string() }),
        );
    }

    /// Keepalives recorded for one site (test observability).
    pub fn keepalive_count(&self, portal_id: PortalId, site_id: SiteId) -> u64 {
        self.inner
            .portals
            .lock()
            .unwrap()
            .get(&portal_id)
            .and_then(|slot| slot.keepalives.get(&site_id).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceApi for LocalPortalService {
    async fn create_portal(&self) -> Result<PortalRecord, ResourceError> {
        let id = Uuid::new_v4();
        self.inner.portals.lock().unwrap().insert(
            id,
            PortalSlot {
                // Host holds 1; guests start at 2.
                next_site: 2,
                active_editor: None,
                keepalives: HashMap::new(),
            },
        );
        log::info!("Service: portal {id} created");
        Ok(PortalRecord { id })
    }

    async fn join_portal(&self, id: PortalId) -> Result<JoinRecord, ResourceError> {
        let mut portals = self.inner.portals.lock().unwrap();
        let slot = portals.get_mut(&id).ok_or(ResourceError::NotFound(id))?;
        let site_id = slot.next_site;
        slot.next_site += 1;
        log::info!("Service: site {site_id} joined portal {id}");
        Ok(JoinRecord {
            site_id,
            active_editor_id: slot.active_editor,
        })
    }

    async fn set_active_editor(
        &self,
        id: PortalId,
        editor: Option<EditorId>,
    ) -> Result<(), ResourceError> {
        {
            let mut portals = self.inner.portals.lock().unwrap();
            let slot = portals.get_mut(&id).ok_or(ResourceError::NotFound(id))?;
            slot.active_editor = editor;
        }
        self.inner.bus.publish(
            &portal_channel(id),
            "update",
            serde_json::json!({ "activeEditorId": editor }),
        );
        Ok(())
    }

    async fn keepalive(&self, id: PortalId, site_id: SiteId) -> Result<(), ResourceError> {
        let mut portals = self.inner.portals.lock().unwrap();
        let slot = portals.get_mut(&id).ok_or(ResourceError::NotFound(id))?;
        *slot.keepalives.entry(site_id).or_insert(0) += 1;
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared-editor stand-in
// ───────────────────────────────────────────────────────────────────

/// Shared editor recording the disconnects it was told about.
pub struct LocalEditor {
    id: EditorId,
    disconnected: Mutex<Vec<SiteId>>,
}

impl LocalEditor {
    pub fn disconnected_sites(&self) -> Vec<SiteId> {
        self.disconnected.lock().unwrap().clone()
    }
}

impl SharedEditor for LocalEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn site_did_disconnect(&self, site_id: SiteId) {
        self.disconnected.lock().unwrap().push(site_id);
    }
}

/// In-process editor registry.
#[derive(Clone)]
pub struct LocalEditors {
    editors: Arc<Mutex<HashMap<EditorId, Arc<LocalEditor>>>>,
}

impl LocalEditors {
    pub fn new() -> Self {
        Self {
            editors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: EditorId) -> Option<Arc<LocalEditor>> {
        self.editors.lock().unwrap().get(&id).cloned()
    }
}

impl Default for LocalEditors {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EditorRegistry for LocalEditors {
    async fn create_editor(&self) -> Result<Arc<dyn SharedEditor>, EditorError> {
        let editor = Arc::new(LocalEditor {
            id: Uuid::new_v4(),
            disconnected: Mutex::new(Vec::new()),
        });
        self.editors
            .lock()
            .unwrap()
            .insert(editor.id, editor.clone());
        Ok(editor)
    }

    async fn join_editor(&self, id: EditorId) -> Result<Arc<dyn SharedEditor>, EditorError> {
        self.get(id)
            .map(|editor| editor as Arc<dyn SharedEditor>)
            .ok_or(EditorError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{GatewayConfig, PubSubGateway};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_publish_reaches_subscribed_connection() {
        let bus = LocalSignalBus::new();
        let gateway = PubSubGateway::new(bus.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = gateway.subscribe("/portals/abc", "update", tx).await.unwrap();

        bus.publish("/portals/abc", "update", serde_json::json!({"n": 7}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["n"], 7);
    }

    #[tokio::test]
    async fn test_publish_does_not_cross_channels() {
        let bus = LocalSignalBus::new();
        let gateway = PubSubGateway::new(bus.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = gateway.subscribe("/portals/abc", "update", tx).await.unwrap();

        bus.publish("/portals/other", "update", serde_json::json!({}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bus_connection_teardown_is_observable() {
        let bus = LocalSignalBus::new();
        let gateway = PubSubGateway::with_config(
            bus.clone(),
            GatewayConfig {
                teardown_grace: Duration::from_millis(10),
            },
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sub = gateway.subscribe("/portals/abc", "update", tx).await.unwrap();
        assert_eq!(bus.connection_count(), 1);

        sub.dispose();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_site_assignment_is_monotonic() {
        let service = LocalPortalService::new(LocalSignalBus::new());
        let portal = service.create_portal().await.unwrap();

        let first = service.join_portal(portal.id).await.unwrap();
        let second = service.join_portal(portal.id).await.unwrap();
        assert_eq!(first.site_id, 2);
        assert_eq!(second.site_id, 3);
    }

    #[tokio::test]
    async fn test_join_unknown_portal_fails() {
        let service = LocalPortalService::new(LocalSignalBus::new());
        let result = service.join_portal(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ResourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_join_reports_current_active_editor() {
        let service = LocalPortalService::new(LocalSignalBus::new());
        let portal = service.create_portal().await.unwrap();
        let editor_id = Uuid::new_v4();
        service
            .set_active_editor(portal.id, Some(editor_id))
            .await
            .unwrap();

        let join = service.join_portal(portal.id).await.unwrap();
        assert_eq!(join.active_editor_id, Some(editor_id));
    }

    #[tokio::test]
    async fn test_editor_registry_join_after_create() {
        let editors = LocalEditors::new();
        let created = editors.create_editor().await.unwrap();
        let joined = editors.join_editor(created.id()).await.unwrap();
        assert_eq!(created.id(), joined.id());

        let missing = editors.join_editor(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(EditorError::NotFound(_))));
    }
}
