//! Instance static/dynamic/scheduling state, grounded on
//! `digs_instance.h`, `resource_info.cpp`, `resource_load.cpp` and
//! `res_schedule_info.cpp` from the original management service.

use crate::meta_resource::MetaResource;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// How an instance was configured to participate in the P/D split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceLabel {
    PrefillStatic,
    DecodeStatic,
    PrefillPrefer,
    DecodePrefer,
}

/// The role assigned by the role manager: what this instance is currently
/// serving as. `Unset` is the initial state before the first role-manager
/// period runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceRole {
    Unset,
    Prefill,
    Decode,
    Flex,
}

/// What the scheduler is currently using the instance for, which may lag
/// the assigned role by one tick while in-flight requests drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceDuty {
    Idle,
    Prefilling,
    Decoding,
    Mixing,
}

fn role_compatible_with_label(role: InstanceRole, label: InstanceLabel) -> bool {
    match label {
        InstanceLabel::PrefillStatic => matches!(role, InstanceRole::Prefill),
        InstanceLabel::DecodeStatic => matches!(role, InstanceRole::Decode),
        InstanceLabel::PrefillPrefer | InstanceLabel::DecodePrefer => true,
    }
}

fn duty_compatible_with_label(duty: InstanceDuty, label: InstanceLabel) -> bool {
    match label {
        InstanceLabel::PrefillStatic => matches!(duty, InstanceDuty::Prefilling | InstanceDuty::Idle),
        InstanceLabel::DecodeStatic => matches!(duty, InstanceDuty::Decoding | InstanceDuty::Idle),
        InstanceLabel::PrefillPrefer | InstanceLabel::DecodePrefer => true,
    }
}

/// Static identity and connectivity of an instance, set at registration
/// time and not expected to change over the instance's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInfo {
    pub instance_id: String,
    pub group_id: String,
    pub address: String,
    pub label: InstanceLabel,
    pub hardware_type: String,
    pub peers: Vec<String>,
    pub max_connection_num: u64,
    pub attr_names: Vec<String>,
}

/// Total capacity and configured max-resource ceilings for an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub static_info: StaticInfo,
    pub total_resource: MetaResource,
    pub max_prefill_res: MetaResource,
    pub max_decode_res: MetaResource,
    pub max_res_rate: f64,
}

impl ResourceInfo {
    pub fn new(static_info: StaticInfo, total_resource: MetaResource, max_res_rate: f64) -> Self {
        let max_prefill_res = total_resource
            .res_mul(max_res_rate)
            .unwrap_or_else(|_| MetaResource::from_attrs(vec![0; total_resource.len()]));
        let max_decode_res = max_prefill_res.clone();
        Self {
            static_info,
            total_resource,
            max_prefill_res,
            max_decode_res,
            max_res_rate,
        }
    }

    /// Recomputes max-resource ceilings after `max_res_rate` changes,
    /// mirroring `ResourceInfo::ReviseMaxResource`.
    pub fn revise_max_resource(&mut self, new_rate: f64) {
        if (new_rate - self.max_res_rate).abs() < f64::EPSILON {
            return;
        }
        self.max_res_rate = new_rate;
        if let Ok(scaled) = self.total_resource.res_mul(new_rate) {
            self.max_prefill_res = scaled.clone();
            self.max_decode_res = scaled;
        }
    }

    /// Overwrites totals from freshly reported telemetry, matching
    /// `ResourceInfo::UpdateStaticInfo`.
    pub fn update_static_info(&mut self, total_resource: MetaResource) {
        if total_resource != self.total_resource {
            tracing::info!(
                instance = %self.static_info.instance_id,
                old_slots = self.total_resource.slots(),
                new_slots = total_resource.slots(),
                old_blocks = self.total_resource.blocks(),
                new_blocks = total_resource.blocks(),
                "instance total resource changed"
            );
            self.total_resource = total_resource;
        }
    }
}

/// Point-in-time load telemetry reported by an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLoad {
    pub avail_slots_num: u64,
    pub avail_block_num: u64,
    pub max_avail_block_num: u64,
    pub total_block_num: u64,
}

impl ResourceLoad {
    pub fn is_res_available(&self) -> bool {
        self.avail_slots_num > 0 && self.avail_block_num > 0 && self.max_avail_block_num > 0
    }

    pub fn used_blocks(&self) -> u64 {
        self.total_block_num.saturating_sub(self.avail_block_num)
    }
}

/// Mutable per-instance scheduling bookkeeping: role/duty, open/closed
/// state, outstanding demand, and the dynamic-max-resource-rate feedback
/// loop. Grounded on `res_schedule_info.h`/`.cpp`.
#[derive(Debug)]
pub struct ResScheduleInfo {
    pub instance_id: String,
    role: std::sync::RwLock<InstanceRole>,
    duty: std::sync::RwLock<InstanceDuty>,
    label: InstanceLabel,
    closed: AtomicBool,
    prefill_demands: std::sync::RwLock<MetaResource>,
    decode_demands: std::sync::RwLock<MetaResource>,
    count_allocate_unmatch: AtomicI64,
    dynamic_res_rate: std::sync::RwLock<f64>,
    max_dynamic_res_rate_count: i64,
    dynamic_res_rate_unit: f64,
}

impl ResScheduleInfo {
    pub fn new(instance_id: String, label: InstanceLabel, attr_count: usize) -> Self {
        Self {
            instance_id,
            role: std::sync::RwLock::new(InstanceRole::Unset),
            duty: std::sync::RwLock::new(InstanceDuty::Idle),
            label,
            closed: AtomicBool::new(false),
            prefill_demands: std::sync::RwLock::new(MetaResource::with_attr_count(attr_count)),
            decode_demands: std::sync::RwLock::new(MetaResource::with_attr_count(attr_count)),
            count_allocate_unmatch: AtomicI64::new(0),
            dynamic_res_rate: std::sync::RwLock::new(1.0),
            max_dynamic_res_rate_count: 3,
            dynamic_res_rate_unit: 0.1,
        }
    }

    pub fn role(&self) -> InstanceRole {
        *self.role.read().expect("role lock poisoned")
    }

    pub fn duty(&self) -> InstanceDuty {
        *self.duty.read().expect("duty lock poisoned")
    }

    /// Rejects role changes incompatible with the instance's static label,
    /// returning `false` without mutating state. Matches
    /// `ResScheduleInfo::UpdateRole`.
    pub fn update_role(&self, new_role: InstanceRole) -> bool {
        if !role_compatible_with_label(new_role, self.label) {
            tracing::warn!(
                instance = %self.instance_id,
                ?new_role,
                label = ?self.label,
                "rejected role update incompatible with static label"
            );
            return false;
        }
        *self.role.write().expect("role lock poisoned") = new_role;
        true
    }

    pub fn update_duty(&self, new_duty: InstanceDuty) -> bool {
        if !duty_compatible_with_label(new_duty, self.label) {
            tracing::warn!(
                instance = %self.instance_id,
                ?new_duty,
                label = ?self.label,
                "rejected duty update incompatible with static label"
            );
            return false;
        }
        *self.duty.write().expect("duty lock poisoned") = new_duty;
        true
    }

    pub fn close_instance(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn activate_instance(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn prefill_demands(&self) -> MetaResource {
        self.prefill_demands.read().expect("lock poisoned").clone()
    }

    pub fn decode_demands(&self) -> MetaResource {
        self.decode_demands.read().expect("lock poisoned").clone()
    }

    pub fn add_prefill_demand(&self, demand: &MetaResource) {
        self.prefill_demands
            .write()
            .expect("lock poisoned")
            .inc_resource(demand);
    }

    pub fn add_decode_demand(&self, demand: &MetaResource) {
        self.decode_demands
            .write()
            .expect("lock poisoned")
            .inc_resource(demand);
    }

    pub fn remove_prefill_demand(&self, demand: &MetaResource) -> crate::error::DigsResult<()> {
        self.prefill_demands.write().expect("lock poisoned").dec_resource(demand)
    }

    pub fn remove_decode_demand(&self, demand: &MetaResource) -> crate::error::DigsResult<()> {
        self.decode_demands.write().expect("lock poisoned").dec_resource(demand)
    }

    /// `CheckOverload`: Prefilling/Decoding check their own demand against
    /// the matching ceiling; Mixing requires *both* to be non-satisfied.
    pub fn check_overload(&self, max_prefill_res: &MetaResource, max_decode_res: &MetaResource) -> bool {
        let prefill_over = !max_prefill_res.ge(&self.prefill_demands());
        let decode_over = !max_decode_res.ge(&self.decode_demands());
        match self.duty() {
            InstanceDuty::Prefilling => prefill_over,
            InstanceDuty::Decoding => decode_over,
            InstanceDuty::Mixing => prefill_over && decode_over,
            InstanceDuty::Idle => false,
        }
    }

    /// Feeds the allocate/overload agreement counter that drives the
    /// dynamic max-resource-rate adjustment.
    pub fn count_allocate_unmatch(&self, is_res_available: bool, is_overloaded: bool) {
        if is_res_available && is_overloaded {
            self.count_allocate_unmatch.fetch_add(1, Ordering::SeqCst);
        } else if !is_res_available && !is_overloaded {
            self.count_allocate_unmatch.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Returns a new max-resource rate once the unmatch counter crosses
    /// the configured threshold, resetting the counter. `None` means no
    /// adjustment this tick.
    pub fn generate_dynamic_res_rate(&self) -> Option<f64> {
        let count = self.count_allocate_unmatch.load(Ordering::SeqCst);
        if count.abs() < self.max_dynamic_res_rate_count {
            return None;
        }
        let mut rate = self.dynamic_res_rate.write().expect("lock poisoned");
        let delta = if count > 0 {
            self.dynamic_res_rate_unit
        } else {
            -self.dynamic_res_rate_unit
        };
        *rate = (*rate + delta).max(0.0);
        self.count_allocate_unmatch.store(0, Ordering::SeqCst);
        Some(*rate)
    }

    pub fn total_connection(&self) -> u64 {
        self.prefill_demands()
            .slots()
            .saturating_add(self.decode_demands().slots())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched(label: InstanceLabel) -> ResScheduleInfo {
        ResScheduleInfo::new("inst-1".into(), label, 2)
    }

    #[test]
    fn role_update_rejects_incompatible_label() {
        let s = sched(InstanceLabel::PrefillStatic);
        assert!(!s.update_role(InstanceRole::Decode));
        assert_eq!(s.role(), InstanceRole::Unset);
        assert!(s.update_role(InstanceRole::Prefill));
        assert_eq!(s.role(), InstanceRole::Prefill);
    }

    #[test]
    fn dynamic_res_rate_only_adjusts_past_threshold() {
        let s = sched(InstanceLabel::PrefillPrefer);
        for _ in 0..2 {
            s.count_allocate_unmatch(true, true);
        }
        assert!(s.generate_dynamic_res_rate().is_none());
        s.count_allocate_unmatch(true, true);
        assert_eq!(s.generate_dynamic_res_rate(), Some(1.1));
    }
}
