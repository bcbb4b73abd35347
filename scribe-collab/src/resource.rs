//! Request/response resource boundary for portal and site metadata.
//!
//! Portals and site assignments are allocated by an external service over an
//! HTTP-like transport; this crate only depends on the [`ResourceApi`]
//! contract. [`LocalPortalService`](crate::local::LocalPortalService) is the
//! in-process implementation.

use async_trait::async_trait;

use crate::protocol::{EditorId, PortalId, SiteId};

/// Result of allocating a new portal.
#[derive(Debug, Clone)]
pub struct PortalRecord {
    pub id: PortalId,
}

/// Result of joining an existing portal.
#[derive(Debug, Clone)]
pub struct JoinRecord {
    /// Server-assigned site id, always greater than the host's reserved 1.
    pub site_id: SiteId,
    /// The portal's currently active shared editor, if any.
    pub active_editor_id: Option<EditorId>,
}

/// Resource layer errors.
#[derive(Debug, Clone)]
pub enum ResourceError {
    NotFound(PortalId),
    Unavailable(String),
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Portal not found: {id}"),
            Self::Unavailable(e) => write!(f, "Resource service unavailable: {e}"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Portal/site metadata service.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Allocate a new portal.
    async fn create_portal(&self) -> Result<PortalRecord, ResourceError>;

    /// Join a portal, obtaining a site assignment and the currently active
    /// editor.
    async fn join_portal(&self, id: PortalId) -> Result<JoinRecord, ResourceError>;

    /// Record the portal's active shared editor (or clear it). The service
    /// fans this out to subscribers as an `update` event.
    async fn set_active_editor(
        &self,
        id: PortalId,
        editor: Option<EditorId>,
    ) -> Result<(), ResourceError>;

    /// Liveness keepalive for one site. Missed keepalives are observed
    /// server-side and come back as `disconnect-site` events.
    async fn keepalive(&self, id: PortalId, site_id: SiteId) -> Result<(), ResourceError>;
}

/// Pub/sub channel carrying a portal's control events.
pub fn portal_channel(id: PortalId) -> String {
    format!("/portals/{id}")
}
