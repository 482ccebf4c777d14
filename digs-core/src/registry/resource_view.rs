//! Per-tick immutable resource view: a snapshot of the registry partitioned
//! into prefill/decode/global pools, with an id-keyed side table for O(1)
//! demand release. Grounded on `resource_view_manager.h`/`.cpp`.

use crate::instance::{InstanceLabel, ResScheduleInfo, ResourceInfo, ResourceLoad};
use crate::registry::resource_registry::ResourceRegistry;
use crate::request::{ReleaseStage, Request};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ViewEntry {
    pub info: ResourceInfo,
    pub load: ResourceLoad,
    pub schedule: Arc<ResScheduleInfo>,
}

impl ViewEntry {
    pub fn id(&self) -> &str {
        &self.info.static_info.instance_id
    }

    pub fn is_connectable(&self, max_connection_num: u64) -> bool {
        max_connection_num > self.schedule.total_connection()
    }

    pub fn peer_connectable(&self, other_id: &str) -> bool {
        self.id() == other_id || self.info.static_info.peers.iter().any(|p| p == other_id)
    }
}

/// A tick's resource snapshot: the full id-keyed side table plus the
/// pool partitioning pool policies consume.
#[derive(Clone, Default)]
pub struct ResourceView {
    entries: HashMap<String, ViewEntry>,
    pub prefill_pool: Vec<String>,
    pub decode_pool: HashMap<String, Vec<String>>,
    pub global_pool: Vec<String>,
}

impl ResourceView {
    pub fn get(&self, id: &str) -> Option<&ViewEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries.values()
    }

    fn add2grouped_pool(pool: &mut HashMap<String, Vec<String>>, group_id: &str, id: String) {
        pool.entry(group_id.to_string()).or_default().push(id);
    }

    /// Dispatches a freshly snapshotted instance into the right pool by
    /// its static label, matching `ResourceViewManager::AddResInfo`.
    fn add_entry(&mut self, entry: ViewEntry) {
        let id = entry.id().to_string();
        let group_id = entry.info.static_info.group_id.clone();
        match entry.info.static_info.label {
            InstanceLabel::PrefillStatic => {
                entry.schedule.update_duty(crate::instance::InstanceDuty::Prefilling);
                self.prefill_pool.push(id.clone());
            }
            InstanceLabel::DecodeStatic => {
                entry.schedule.update_duty(crate::instance::InstanceDuty::Decoding);
                Self::add2grouped_pool(&mut self.decode_pool, &group_id, id.clone());
            }
            InstanceLabel::PrefillPrefer | InstanceLabel::DecodePrefer => {
                self.global_pool.push(id.clone());
            }
        }
        self.entries.insert(id, entry);
    }

    pub fn check_connection(&self, id: &str, max_connection_num: u64) -> bool {
        self.entries
            .get(id)
            .map(|e| e.is_connectable(max_connection_num))
            .unwrap_or(false)
    }

    pub fn check_connection_with_peer(&self, id: &str, other_id: &str, max_connection_num: u64) -> bool {
        self.entries
            .get(id)
            .map(|e| e.is_connectable(max_connection_num) && e.peer_connectable(other_id))
            .unwrap_or(false)
    }
}

pub struct ResourceViewManager {
    view: std::sync::RwLock<ResourceView>,
}

impl Default for ResourceViewManager {
    fn default() -> Self {
        Self {
            view: std::sync::RwLock::new(ResourceView::default()),
        }
    }
}

impl ResourceViewManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ResourceView {
        self.view.read().expect("lock poisoned").clone()
    }

    /// Rebuilds the view from a fresh registry snapshot. Calls
    /// `check_overload` on every outgoing entry before discarding it, the
    /// way `ClearView` observes the view one last time before wiping it.
    pub async fn refresh(&self, registry: &ResourceRegistry) -> crate::error::DigsResult<()> {
        let snapshot = registry.snapshot().await?;

        {
            let old = self.view.read().expect("lock poisoned");
            for entry in old.entries.values() {
                let is_overloaded = entry
                    .schedule
                    .check_overload(&entry.info.max_prefill_res, &entry.info.max_decode_res);
                let is_available = entry.load.is_res_available();
                entry.schedule.count_allocate_unmatch(is_available, is_overloaded);
            }
        }

        let mut fresh = ResourceView::default();
        for (info, load, schedule) in snapshot {
            fresh.add_entry(ViewEntry { info, load, schedule });
        }

        *self.view.write().expect("lock poisoned") = fresh;
        Ok(())
    }

    /// Releases the demand a request holds on its assigned instance(s) for
    /// the given stage, matching `UpdateScheduleInfo`. A missing
    /// assignment (never scheduled) is a no-op, not an error.
    pub fn update_schedule_info(&self, req: &Request, stage: ReleaseStage) -> crate::error::DigsResult<()> {
        let Some(sched) = req.schedule_info() else {
            return Ok(());
        };
        let view = self.view.read().expect("lock poisoned");

        if matches!(stage, ReleaseStage::Prefill | ReleaseStage::Both) {
            if let Some(inst_id) = sched.prefill_inst() {
                if let Some(entry) = view.get(&inst_id) {
                    entry.schedule.remove_prefill_demand(&sched.demand())?;
                }
            }
        }
        if matches!(stage, ReleaseStage::Decode | ReleaseStage::Both) {
            if let Some(inst_id) = sched.decode_inst() {
                if let Some(entry) = view.get(&inst_id) {
                    entry.schedule.remove_decode_demand(&sched.demand())?;
                }
            }
        }
        Ok(())
    }

    /// Moves every `global_pool` entry into `prefill_pool`/`decode_pool`
    /// per its static label, leaving unrecognized labels in place. This is
    /// the static pool policy's reassignment step, applied directly to the
    /// view rather than via the erase-and-relocate iteration the original
    /// uses (Rust partitions into fresh vectors instead).
    pub fn apply_static_pool_policy(&self) {
        let mut view = self.view.write().expect("lock poisoned");
        let pending = std::mem::take(&mut view.global_pool);
        for id in pending {
            let Some(entry) = view.entries.get(&id) else { continue };
            match entry.info.static_info.label {
                InstanceLabel::PrefillStatic | InstanceLabel::PrefillPrefer => {
                    entry.schedule.update_duty(crate::instance::InstanceDuty::Prefilling);
                    view.prefill_pool.push(id);
                }
                InstanceLabel::DecodeStatic | InstanceLabel::DecodePrefer => {
                    let group_id = entry.info.static_info.group_id.clone();
                    entry.schedule.update_duty(crate::instance::InstanceDuty::Decoding);
                    ResourceView::add2grouped_pool(&mut view.decode_pool, &group_id, id);
                }
            }
        }
    }
}
