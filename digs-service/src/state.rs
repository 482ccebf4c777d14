//! Shared application state handed to every axum handler, mirroring
//! `GatewayState` but carrying the whole scheduler stack instead of a
//! worker list.

use crate::notify::AllocationNotifier;
use digs_core::registry::{RequestRegistry, ResourceRegistry, ResourceViewManager};
use digs_core::scheduler::GlobalScheduler;
use digs_leader::LeaderLock;
use digs_rolemgr::RoleManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub resource_registry: Arc<ResourceRegistry>,
    pub request_registry: Arc<RequestRegistry>,
    pub view_manager: Arc<ResourceViewManager>,
    pub scheduler: Arc<GlobalScheduler>,
    pub role_manager: Arc<RoleManager>,
    pub notifier: Arc<dyn AllocationNotifier>,
    pub leader_lock: Option<Arc<LeaderLock>>,
    pub attr_count: usize,
}

impl AppState {
    /// `true` when this node is either not running leader election at all
    /// (single-node deployment) or currently holds the lock.
    pub fn is_serving(&self) -> bool {
        self.leader_lock.as_ref().map(|l| l.is_locked()).unwrap_or(true)
    }
}
