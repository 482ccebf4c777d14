//! Instance selection policies, grounded on `inst_select_policy.h`,
//! `static_alloc_policy.h`/`.cpp` and `load_balance_policy.h`/`.cpp`.

use crate::meta_resource::{compute_aware_load, MetaResource, ResWeights};
use crate::registry::resource_view::{ResourceView, ViewEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prefill,
    Decode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectPolicyKind {
    StaticAlloc = 1,
    LoadBalance = 2,
}

/// Ascending by total committed prefill demand -- ties broken by the sort's
/// stability (original insertion order from the view snapshot).
pub fn sort_prefill(pool: &mut [ViewEntry]) {
    pool.sort_by_key(|e| e.schedule.prefill_demands().total_load());
}

/// Ascending by the compute-aware load a candidate would carry if it took
/// this request's decode demand. `reported_blocks` is blocks currently
/// resident (`total - avail`), not available blocks.
pub fn sort_decode(pool: &mut [ViewEntry], demand: &MetaResource, weights: &ResWeights) {
    let max_slots = pool
        .iter()
        .map(|e| e.schedule.decode_demands().slots())
        .max()
        .unwrap_or(0);
    pool.sort_by(|a, b| {
        let score = |e: &ViewEntry| {
            compute_aware_load(
                &e.schedule.decode_demands(),
                max_slots,
                e.load.used_blocks(),
                demand,
                weights,
            )
        };
        score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn is_candidate(entry: &ViewEntry, max_connection_num: u64) -> bool {
    !entry.schedule.is_closed() && entry.is_connectable(max_connection_num)
}

/// A decode candidate must also satisfy the prefill/decode connectivity
/// invariant: `decodeId == prefillId`, or `prefillId` is one of the decode
/// instance's configured peers.
fn is_decode_candidate(entry: &ViewEntry, max_connection_num: u64, prefill_inst_id: &str) -> bool {
    is_candidate(entry, max_connection_num) && entry.peer_connectable(prefill_inst_id)
}

fn within_limit(entry: &ViewEntry, stage: Stage, demand: &MetaResource, max_prefill_res: &MetaResource, max_decode_res: &MetaResource) -> bool {
    let (current, ceiling) = match stage {
        Stage::Prefill => (entry.schedule.prefill_demands(), max_prefill_res),
        Stage::Decode => (entry.schedule.decode_demands(), max_decode_res),
    };
    for i in 0..ceiling.len() {
        if current.at(i) + demand.at(i) > ceiling.at(i) {
            return false;
        }
    }
    true
}

pub trait SelectPolicy: Send + Sync {
    fn load_resource_view(&mut self, view: &ResourceView);
    fn select_prefill_inst(&mut self, demand: &MetaResource) -> Option<(String, String)>;
    fn select_decode_inst(&mut self, group_id: &str, prefill_inst_id: &str, demand: &MetaResource) -> Option<String>;
    fn offload_resource_view(&mut self);
}

/// Never rejects for load; only skips closed or disconnected instances.
pub struct StaticAllocPolicy {
    weights: ResWeights,
    prefill_pool: Vec<ViewEntry>,
    decode_pool: HashMap<String, Vec<ViewEntry>>,
}

impl StaticAllocPolicy {
    pub fn new(weights: ResWeights) -> Self {
        Self {
            weights,
            prefill_pool: Vec::new(),
            decode_pool: HashMap::new(),
        }
    }
}

impl SelectPolicy for StaticAllocPolicy {
    fn load_resource_view(&mut self, view: &ResourceView) {
        self.prefill_pool = view
            .prefill_pool
            .iter()
            .chain(view.global_pool.iter())
            .filter_map(|id| view.get(id).cloned())
            .collect();
        self.decode_pool = view
            .decode_pool
            .iter()
            .map(|(g, ids)| {
                let entries = ids.iter().filter_map(|id| view.get(id).cloned()).collect();
                (g.clone(), entries)
            })
            .collect();
    }

    fn select_prefill_inst(&mut self, demand: &MetaResource) -> Option<(String, String)> {
        if self.prefill_pool.is_empty() {
            return None;
        }
        sort_prefill(&mut self.prefill_pool);
        let entry = self
            .prefill_pool
            .iter()
            .find(|e| is_candidate(e, e.info.static_info.max_connection_num))?;
        entry.schedule.add_prefill_demand(demand);
        Some((entry.id().to_string(), entry.info.static_info.group_id.clone()))
    }

    fn select_decode_inst(&mut self, group_id: &str, prefill_inst_id: &str, demand: &MetaResource) -> Option<String> {
        let pool = self.decode_pool.get_mut(group_id)?;
        if pool.is_empty() {
            return None;
        }
        sort_decode(pool, demand, &self.weights);
        let entry = pool
            .iter()
            .find(|e| is_decode_candidate(e, e.info.static_info.max_connection_num, prefill_inst_id))?;
        entry.schedule.add_decode_demand(demand);
        Some(entry.id().to_string())
    }

    fn offload_resource_view(&mut self) {
        self.prefill_pool.clear();
        self.decode_pool.clear();
    }
}

/// Same pool loading as `StaticAllocPolicy`, but rejects candidates that
/// would exceed their configured max prefill/decode resource.
pub struct LoadBalancePolicy {
    weights: ResWeights,
    prefill_pool: Vec<ViewEntry>,
    decode_pool: HashMap<String, Vec<ViewEntry>>,
}

impl LoadBalancePolicy {
    pub fn new(weights: ResWeights) -> Self {
        Self {
            weights,
            prefill_pool: Vec::new(),
            decode_pool: HashMap::new(),
        }
    }
}

impl SelectPolicy for LoadBalancePolicy {
    fn load_resource_view(&mut self, view: &ResourceView) {
        self.prefill_pool = view
            .prefill_pool
            .iter()
            .chain(view.global_pool.iter())
            .filter_map(|id| view.get(id).cloned())
            .collect();
        self.decode_pool = view
            .decode_pool
            .iter()
            .map(|(g, ids)| {
                let entries = ids.iter().filter_map(|id| view.get(id).cloned()).collect();
                (g.clone(), entries)
            })
            .collect();
    }

    fn select_prefill_inst(&mut self, demand: &MetaResource) -> Option<(String, String)> {
        if self.prefill_pool.is_empty() {
            return None;
        }
        sort_prefill(&mut self.prefill_pool);
        let entry = self.prefill_pool.iter().find(|e| {
            is_candidate(e, e.info.static_info.max_connection_num)
                && within_limit(e, Stage::Prefill, demand, &e.info.max_prefill_res, &e.info.max_decode_res)
        })?;
        entry.schedule.add_prefill_demand(demand);
        Some((entry.id().to_string(), entry.info.static_info.group_id.clone()))
    }

    fn select_decode_inst(&mut self, group_id: &str, prefill_inst_id: &str, demand: &MetaResource) -> Option<String> {
        let pool = self.decode_pool.get_mut(group_id)?;
        if pool.is_empty() {
            return None;
        }
        sort_decode(pool, demand, &self.weights);
        let entry = pool.iter().find(|e| {
            is_decode_candidate(e, e.info.static_info.max_connection_num, prefill_inst_id)
                && within_limit(e, Stage::Decode, demand, &e.info.max_prefill_res, &e.info.max_decode_res)
        })?;
        entry.schedule.add_decode_demand(demand);
        Some(entry.id().to_string())
    }

    fn offload_resource_view(&mut self) {
        self.prefill_pool.clear();
        self.decode_pool.clear();
    }
}
