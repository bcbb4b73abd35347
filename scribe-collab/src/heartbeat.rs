//! Periodic liveness keepalive for one (portal, site) pair.
//!
//! The heartbeat only reports presence; failure detection is server-side.
//! A site whose keepalives lapse is announced to the portal's channel as a
//! `disconnect-site` event, which the portals react to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::protocol::{PortalId, SiteId};
use crate::resource::ResourceApi;

/// Heartbeat tuning knobs.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Keepalive loop for one site's presence in one portal.
pub struct Heartbeat {
    resource: Arc<dyn ResourceApi>,
    portal_id: PortalId,
    site_id: SiteId,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Heartbeat {
    pub fn new(
        resource: Arc<dyn ResourceApi>,
        portal_id: PortalId,
        site_id: SiteId,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            resource,
            portal_id,
            site_id,
            interval: config.interval,
            task: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start ticking. Idempotent; a disposed heartbeat never restarts.
    pub fn start(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let resource = self.resource.clone();
        let portal_id = self.portal_id;
        let site_id = self.site_id;
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the cadence
            // starts one interval after start().
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = resource.keepalive(portal_id, site_id).await {
                    log::warn!("Heartbeat: keepalive failed for site {site_id}: {e}");
                }
            }
        }));
        log::debug!(
            "Heartbeat: started for portal {} site {}",
            self.portal_id,
            self.site_id
        );
    }

    /// Stop ticking. Idempotent, never fails.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        log::debug!(
            "Heartbeat: disposed for portal {} site {}",
            self.portal_id,
            self.site_id
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.dispose();
    }
}
