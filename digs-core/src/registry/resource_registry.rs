//! Concurrent map of instance id to its resource state, grounded on
//! `resource_manager.h`/`.cpp`. Guarded by a `tokio::sync::RwLock` rather
//! than the original's `shared_timed_mutex`, since both the scheduler tick
//! and the HTTP registration handlers are async.

use crate::error::{DigsError, DigsResult};
use crate::instance::{ResScheduleInfo, ResourceInfo, ResourceLoad};
use crate::meta_resource::MetaResource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct InstanceEntry {
    pub info: ResourceInfo,
    pub load: ResourceLoad,
    pub schedule: Arc<ResScheduleInfo>,
}

/// How long `update_resource_view` waits to take the read lock before
/// skipping this tick. Mirrors `resViewUpdateTimeout_`.
const DEFAULT_VIEW_UPDATE_TIMEOUT: Duration = Duration::from_millis(50);

pub struct ResourceRegistry {
    instances: RwLock<HashMap<String, InstanceEntry>>,
    view_update_timeout: Duration,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_VIEW_UPDATE_TIMEOUT)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterOutcome {
    pub registered: u64,
    pub failed: u64,
}

impl ResourceRegistry {
    pub fn new(view_update_timeout: Duration) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            view_update_timeout,
        }
    }

    /// Registers any number of instances in one call, skipping (and
    /// counting) duplicates rather than aborting the whole batch.
    pub async fn register_instances(&self, entries: Vec<(ResourceInfo, ResourceLoad)>) -> RegisterOutcome {
        let mut outcome = RegisterOutcome::default();
        let mut guard = self.instances.write().await;
        for (info, load) in entries {
            let id = info.static_info.instance_id.clone();
            if guard.contains_key(&id) {
                outcome.failed += 1;
                tracing::warn!(instance = %id, "duplicate instance registration rejected");
                continue;
            }
            let attr_count = info.total_resource.len();
            let label = info.static_info.label;
            guard.insert(
                id.clone(),
                InstanceEntry {
                    info,
                    load,
                    schedule: Arc::new(ResScheduleInfo::new(id, label, attr_count)),
                },
            );
            outcome.registered += 1;
        }
        outcome
    }

    pub async fn update_instance(&self, instance_id: &str, load: ResourceLoad, total_resource: MetaResource) -> DigsResult<()> {
        let mut guard = self.instances.write().await;
        let entry = guard
            .get_mut(instance_id)
            .ok_or_else(|| DigsError::ResourceNotFound(instance_id.to_string()))?;
        entry.info.update_static_info(total_resource);
        entry.load = load;
        let is_available = load.is_res_available();
        let is_overloaded = entry
            .schedule
            .check_overload(&entry.info.max_prefill_res, &entry.info.max_decode_res);
        entry.schedule.count_allocate_unmatch(is_available, is_overloaded);
        if let Some(new_rate) = entry.schedule.generate_dynamic_res_rate() {
            entry.info.revise_max_resource(new_rate);
        }
        Ok(())
    }

    pub async fn remove_instance(&self, instance_id: &str) -> DigsResult<()> {
        let mut guard = self.instances.write().await;
        guard
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| DigsError::ResourceNotFound(instance_id.to_string()))
    }

    pub async fn close_instance(&self, instance_id: &str) -> DigsResult<()> {
        let guard = self.instances.read().await;
        let entry = guard
            .get(instance_id)
            .ok_or_else(|| DigsError::ResourceNotFound(instance_id.to_string()))?;
        entry.schedule.close_instance();
        Ok(())
    }

    pub async fn activate_instance(&self, instance_id: &str) -> DigsResult<()> {
        let guard = self.instances.read().await;
        let entry = guard
            .get(instance_id)
            .ok_or_else(|| DigsError::ResourceNotFound(instance_id.to_string()))?;
        entry.schedule.activate_instance();
        Ok(())
    }

    pub async fn query_instance_schedule_info(&self, instance_id: &str) -> DigsResult<(MetaResource, MetaResource)> {
        let guard = self.instances.read().await;
        let entry = guard
            .get(instance_id)
            .ok_or_else(|| DigsError::ResourceNotFound(instance_id.to_string()))?;
        Ok((entry.schedule.prefill_demands(), entry.schedule.decode_demands()))
    }

    /// Snapshots every non-closed instance for this tick's resource view.
    /// Skips the tick entirely (returning `DigsError::Timeout`) if the
    /// read lock can't be taken within `view_update_timeout`, matching the
    /// original's tick-skip-on-lock-timeout semantics.
    pub async fn snapshot(&self) -> DigsResult<Vec<(ResourceInfo, ResourceLoad, Arc<ResScheduleInfo>)>> {
        let guard = tokio::time::timeout(self.view_update_timeout, self.instances.read())
            .await
            .map_err(|_| DigsError::Timeout("resource registry snapshot lock".into()))?;
        Ok(guard
            .values()
            .filter(|e| !e.schedule.is_closed())
            .map(|e| (e.info.clone(), e.load, e.schedule.clone()))
            .collect())
    }

    pub async fn get_schedule(&self, instance_id: &str) -> Option<Arc<ResScheduleInfo>> {
        self.instances.read().await.get(instance_id).map(|e| e.schedule.clone())
    }

    /// The address an outbound notification to this instance should target.
    pub async fn get_address(&self, instance_id: &str) -> Option<String> {
        self.instances.read().await.get(instance_id).map(|e| e.info.static_info.address.clone())
    }
}
