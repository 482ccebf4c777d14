//! Periodic instance role assignment, grounded on
//! `InstanceRoleManager.h` (and its unread `.cpp` body, where the
//! prose in SPEC_FULL.md §7 fills the gap).

use crate::cost_model::ModelSimulator;
use crate::error::RoleManagerResult;
use crate::proportion::{DIGSGroupPDRatio, DIGSRatioType, ProportionCalculator, ProportionInput, DIGS_ROLE_FLEX_NUM};
use digs_core::instance::{InstanceLabel, InstanceRole, ResScheduleInfo, ResourceInfo, ResourceLoad};
use digs_core::registry::{RequestRegistry, ResourceRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub enum RoleManagerMode {
    /// Assign role purely from each instance's reported hardware type; no
    /// proportion calculation.
    Heterogeneous { hardware_role_map: HashMap<String, InstanceRole> },
    /// Cross-node deployments where P/D are pinned by node placement
    /// already; the role manager only counts, never reassigns.
    CrossNodeAsymmetric,
    /// Proportion-calculator-driven assignment.
    Normal,
}

pub struct RoleManagerConfig {
    pub time_period_s: u64,
    pub mode: RoleManagerMode,
    pub ratio_type: DIGSRatioType,
    pub pinned_rate: Option<(u64, u64)>,
}

type Member = (ResourceInfo, ResourceLoad, Arc<ResScheduleInfo>);

/// One instance's new role, as delivered to `NotifyRoleDecision`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RoleDecision {
    pub instance_id: String,
    pub role: InstanceRole,
}

type RoleNotifier = dyn Fn(Vec<RoleDecision>) + Send + Sync;

pub struct RoleManager {
    resource_registry: Arc<ResourceRegistry>,
    request_registry: Arc<RequestRegistry>,
    config: RoleManagerConfig,
    simulator_factory: Box<dyn Fn() -> Box<dyn ModelSimulator> + Send + Sync>,
    role_notifier: Box<RoleNotifier>,
    calculators: Mutex<HashMap<String, ProportionCalculator>>,
    seen_groups: Mutex<HashSet<String>>,
    running: std::sync::atomic::AtomicBool,
}

impl RoleManager {
    pub fn new(
        resource_registry: Arc<ResourceRegistry>,
        request_registry: Arc<RequestRegistry>,
        config: RoleManagerConfig,
        simulator_factory: Box<dyn Fn() -> Box<dyn ModelSimulator> + Send + Sync>,
        role_notifier: Box<RoleNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_registry,
            request_registry,
            config,
            simulator_factory,
            role_notifier,
            calculators: Mutex::new(HashMap::new()),
            seen_groups: Mutex::new(HashSet::new()),
            running: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(this.config.time_period_s.max(1)));
            while this.running.load(std::sync::atomic::Ordering::SeqCst) {
                interval.tick().await;
                if let Err(err) = this.run_once().await {
                    tracing::warn!(?err, "role manager period failed");
                }
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// One period: reassigns every group's roles, then delivers every
    /// instance whose role actually changed as a single `NotifyRoleDecision`
    /// batch. The original calls the notifier once per group from inside
    /// the group loop as well as once more at the caller for the whole
    /// batch, which reads as an accidental duplicate delivery; this only
    /// delivers once, after all groups are processed.
    pub async fn run_once(&self) -> RoleManagerResult<()> {
        let snapshot = self.resource_registry.snapshot().await?;
        let mut groups: HashMap<String, Vec<Member>> = HashMap::new();
        for (info, load, sched) in snapshot {
            groups.entry(info.static_info.group_id.clone()).or_default().push((info, load, sched));
        }

        let summary = self.request_registry.profiler.calculate_summary().await;
        let mut decisions = Vec::new();

        for (group_id, mut members) in groups {
            match &self.config.mode {
                RoleManagerMode::CrossNodeAsymmetric => continue,
                RoleManagerMode::Heterogeneous { hardware_role_map } => {
                    decisions.extend(self.assign_role_by_hardware_type(&members, hardware_role_map));
                }
                RoleManagerMode::Normal => {
                    decisions.extend(self.assign_role_normal(&group_id, &mut members, summary).await?);
                }
            }
        }

        if !decisions.is_empty() {
            (self.role_notifier)(decisions);
        }
        Ok(())
    }

    fn assign_role_by_hardware_type(&self, members: &[Member], map: &HashMap<String, InstanceRole>) -> Vec<RoleDecision> {
        let mut decisions = Vec::new();
        for (info, _load, sched) in members {
            match map.get(&info.static_info.hardware_type) {
                Some(role) => {
                    if sched.update_role(*role) {
                        decisions.push(RoleDecision {
                            instance_id: info.static_info.instance_id.clone(),
                            role: *role,
                        });
                    }
                }
                None => {
                    tracing::warn!(
                        hardware_type = %info.static_info.hardware_type,
                        instance = %info.static_info.instance_id,
                        "no role mapping for hardware type, leaving role unchanged"
                    );
                }
            }
        }
        decisions
    }

    async fn assign_role_normal(
        &self,
        group_id: &str,
        members: &mut Vec<Member>,
        summary: digs_core::registry::RequestSummary,
    ) -> RoleManagerResult<Vec<RoleDecision>> {
        let mut seen = self.seen_groups.lock().await;
        let is_first = seen.insert(group_id.to_string());
        drop(seen);

        let mut calcs = self.calculators.lock().await;
        let calc = calcs
            .entry(group_id.to_string())
            .or_insert_with(|| ProportionCalculator::with_simulator((self.simulator_factory)()));
        if let Some((p, d)) = self.config.pinned_rate {
            calc.set_extern_rate(p, d);
        }

        let flex_inst_num = if matches!(self.config.ratio_type, DIGSRatioType::PdFlex) {
            DIGS_ROLE_FLEX_NUM as i64
        } else {
            0
        };
        let input = ProportionInput {
            instance_num: members.len() as u64,
            summary,
            ratio_type: self.config.ratio_type,
            flex_inst_num,
            is_first,
        };
        let ratio = calc.cal_proportion(input)?;
        drop(calcs);

        Self::sort_instance(members);
        Ok(Self::apply_ratio(members, ratio))
    }

    /// Ranks group members for role (re)assignment: role-unset instances
    /// first (nothing to disturb), then instances whose static label
    /// already prefers the role being considered, then by ascending
    /// currently-allocated load (so a role flip lands on the least-loaded
    /// instance first), tie-broken by instance id for determinism.
    fn sort_instance(members: &mut [Member]) {
        members.sort_by(|a, b| {
            let key = |m: &Member| {
                let (info, _load, sched) = m;
                let role_already_assigned = !matches!(sched.role(), InstanceRole::Unset);
                let is_static_label =
                    !matches!(info.static_info.label, InstanceLabel::PrefillPrefer | InstanceLabel::DecodePrefer);
                let allocated_slots = sched.prefill_demands().slots() + sched.decode_demands().slots();
                let allocated_blocks = sched.prefill_demands().blocks() + sched.decode_demands().blocks();
                (
                    role_already_assigned,
                    is_static_label,
                    allocated_slots,
                    allocated_blocks,
                    info.static_info.instance_id.clone(),
                )
            };
            key(a).cmp(&key(b))
        });
    }

    /// Assigns the first `ratio.prefill_num` sorted members to `Prefill`,
    /// the next `ratio.decode_num` to `Decode`, and up to `ratio.flex_num`
    /// after that to `Flex`. `update_role` silently rejects assignments
    /// incompatible with an instance's static label (e.g. a `DecodeStatic`
    /// instance can never become `Prefill`), so a statically-pinned
    /// instance simply keeps its role through this loop.
    fn apply_ratio(members: &[Member], ratio: DIGSGroupPDRatio) -> Vec<RoleDecision> {
        let mut decisions = Vec::new();
        let mut idx = 0usize;
        let mut assign = |idx: &mut usize, role: InstanceRole, decisions: &mut Vec<RoleDecision>| -> bool {
            let Some((info, _, sched)) = members.get(*idx) else { return false };
            if sched.update_role(role) {
                decisions.push(RoleDecision {
                    instance_id: info.static_info.instance_id.clone(),
                    role,
                });
            }
            *idx += 1;
            true
        };
        for _ in 0..ratio.prefill_num {
            if !assign(&mut idx, InstanceRole::Prefill, &mut decisions) {
                break;
            }
        }
        for _ in 0..ratio.decode_num {
            if !assign(&mut idx, InstanceRole::Decode, &mut decisions) {
                break;
            }
        }
        for _ in 0..ratio.flex_num {
            if !assign(&mut idx, InstanceRole::Flex, &mut decisions) {
                break;
            }
        }
        decisions
    }
}
