//! Concrete-input role-assignment scenarios. Abilities come from a
//! hand-picked test double rather than `LlamaSimulator` -- the roofline
//! model's calibration is a separate concern from whether
//! `RoleManager`/`ProportionCalculator` correctly turn a given ability pair
//! into an instance count, which is what these scenarios check.

use digs_core::instance::{InstanceLabel, InstanceRole, ResourceInfo, ResourceLoad, StaticInfo};
use digs_core::meta_resource::MetaResource;
use digs_core::registry::{RequestRegistry, ResourceRegistry};
use digs_rolemgr::{DIGSRatioType, ModelSimulator, RoleManager, RoleManagerConfig, RoleManagerMode, SimulatedAbility};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct FixedAbility {
    p_ability: f64,
    d_ability: f64,
}

impl ModelSimulator for FixedAbility {
    fn simulate(&self, _avg_input_length: u64, _avg_output_length: u64) -> SimulatedAbility {
        SimulatedAbility {
            p_ability: self.p_ability,
            d_ability: self.d_ability,
            t_ability: 0.0,
        }
    }
}

fn instance(id: &str, group_id: &str, label: InstanceLabel) -> (ResourceInfo, ResourceLoad) {
    let static_info = StaticInfo {
        instance_id: id.into(),
        group_id: group_id.into(),
        address: format!("127.0.0.1:0#{id}"),
        label,
        hardware_type: "h100".into(),
        peers: Vec::new(),
        max_connection_num: 64,
        attr_names: vec!["slots".into(), "blocks".into()],
    };
    let total_resource = MetaResource::from_attrs(vec![64, 1024]);
    let info = ResourceInfo::new(static_info, total_resource, 1.0);
    let load = ResourceLoad {
        avail_slots_num: 64,
        avail_block_num: 1024,
        max_avail_block_num: 1024,
        total_block_num: 1024,
    };
    (info, load)
}

fn manager_with(
    resource_registry: Arc<ResourceRegistry>,
    mode: RoleManagerMode,
    pinned_rate: Option<(u64, u64)>,
    ability: FixedAbility,
) -> Arc<RoleManager> {
    let request_registry = Arc::new(RequestRegistry::new(Box::new(|_req, _stage| Ok(())), Box::new(|_| {})));
    let config = RoleManagerConfig {
        time_period_s: 60,
        mode,
        ratio_type: DIGSRatioType::Pd,
        pinned_rate,
    };
    let p_ability = ability.p_ability;
    let d_ability = ability.d_ability;
    RoleManager::new(
        resource_registry,
        request_registry,
        config,
        Box::new(move || Box::new(FixedAbility { p_ability, d_ability })),
        Box::new(|_decisions| {}),
    )
}

async fn roles_by_id(resource_registry: &ResourceRegistry) -> HashMap<String, InstanceRole> {
    resource_registry
        .snapshot()
        .await
        .expect("snapshot")
        .into_iter()
        .map(|(info, _load, sched)| (info.static_info.instance_id, sched.role()))
        .collect()
}

/// Scenario 1: a long-prefill-dominant workload, modeled as a per-instance
/// prefill ability well below the decode ability, pushes a 3-instance group
/// to 2 PREFILL, 1 DECODE -- more prefill capacity is needed to keep pace.
#[tokio::test]
async fn long_prefill_workload_yields_two_prefill_one_decode() {
    let resource_registry = Arc::new(ResourceRegistry::new(Duration::from_millis(200)));
    resource_registry
        .register_instances(vec![
            instance("i0", "g1", InstanceLabel::PrefillPrefer),
            instance("i1", "g1", InstanceLabel::PrefillPrefer),
            instance("i2", "g1", InstanceLabel::DecodePrefer),
        ])
        .await;

    let manager = manager_with(
        resource_registry.clone(),
        RoleManagerMode::Normal,
        None,
        FixedAbility { p_ability: 1.0, d_ability: 3.0 },
    );
    manager.run_once().await.expect("role assignment period");

    let roles = roles_by_id(&resource_registry).await;
    let prefill_count = roles.values().filter(|r| **r == InstanceRole::Prefill).count();
    let decode_count = roles.values().filter(|r| **r == InstanceRole::Decode).count();
    assert_eq!((prefill_count, decode_count), (2, 1));
}

/// Scenario 2: a decode-dominant workload (long output, short input) flips
/// the ratio the other way on a 5-instance group -- fewer prefill instances
/// are needed than decode instances.
#[tokio::test]
async fn decode_dominant_workload_yields_fewer_prefill_than_decode() {
    let resource_registry = Arc::new(ResourceRegistry::new(Duration::from_millis(200)));
    resource_registry
        .register_instances(vec![
            instance("i0", "g1", InstanceLabel::PrefillPrefer),
            instance("i1", "g1", InstanceLabel::PrefillPrefer),
            instance("i2", "g1", InstanceLabel::DecodePrefer),
            instance("i3", "g1", InstanceLabel::DecodePrefer),
            instance("i4", "g1", InstanceLabel::DecodePrefer),
        ])
        .await;

    let manager = manager_with(
        resource_registry.clone(),
        RoleManagerMode::Normal,
        None,
        FixedAbility { p_ability: 3.0, d_ability: 1.0 },
    );
    manager.run_once().await.expect("role assignment period");

    let roles = roles_by_id(&resource_registry).await;
    let prefill_count = roles.values().filter(|r| **r == InstanceRole::Prefill).count();
    let decode_count = roles.values().filter(|r| **r == InstanceRole::Decode).count();
    assert_eq!(prefill_count + decode_count, 5);
    assert!(prefill_count < decode_count, "expected pNum < dNum, got {prefill_count} vs {decode_count}");
}

/// Scenario 3: an operator-pinned 1:15 rate on a 17-instance group lands
/// within one instance of the exact split, per `init_best_ratio_with_extern_input`'s
/// integer-division rounding.
#[tokio::test]
async fn pinned_rate_on_seventeen_instances_rounds_to_one_of_two_splits() {
    let resource_registry = Arc::new(ResourceRegistry::new(Duration::from_millis(200)));
    let mut entries = Vec::new();
    for i in 0..17 {
        let label = if i == 0 { InstanceLabel::PrefillPrefer } else { InstanceLabel::DecodePrefer };
        entries.push(instance(&format!("i{i}"), "g1", label));
    }
    resource_registry.register_instances(entries).await;

    let manager = manager_with(
        resource_registry.clone(),
        RoleManagerMode::Normal,
        Some((1, 15)),
        FixedAbility { p_ability: 1.0, d_ability: 1.0 },
    );
    manager.run_once().await.expect("role assignment period");

    let roles = roles_by_id(&resource_registry).await;
    let prefill_count = roles.values().filter(|r| **r == InstanceRole::Prefill).count();
    let decode_count = roles.values().filter(|r| **r == InstanceRole::Decode).count();
    assert!(
        (prefill_count, decode_count) == (1, 16) || (prefill_count, decode_count) == (2, 15),
        "expected (1,16) or (2,15), got ({prefill_count},{decode_count})"
    );
}

/// Scenario 4: heterogeneous mode assigns role purely from hardware type --
/// the two smaller cards become PREFILL, the two larger ones DECODE,
/// regardless of the (unused, in this mode) request-length summary.
#[tokio::test]
async fn heterogeneous_mode_assigns_role_by_hardware_type_only() {
    let resource_registry = Arc::new(ResourceRegistry::new(Duration::from_millis(200)));

    let mk = |id: &str, hw: &str| {
        let static_info = StaticInfo {
            instance_id: id.into(),
            group_id: "g1".into(),
            address: format!("127.0.0.1:0#{id}"),
            label: InstanceLabel::PrefillPrefer,
            hardware_type: hw.into(),
            peers: Vec::new(),
            max_connection_num: 64,
            attr_names: vec!["slots".into(), "blocks".into()],
        };
        let total_resource = MetaResource::from_attrs(vec![64, 1024]);
        let info = ResourceInfo::new(static_info, total_resource, 1.0);
        let load = ResourceLoad {
            avail_slots_num: 64,
            avail_block_num: 1024,
            max_avail_block_num: 1024,
            total_block_num: 1024,
        };
        (info, load)
    };

    resource_registry
        .register_instances(vec![
            mk("card-32g-a", "800I A2(32G)"),
            mk("card-32g-b", "800I A2(32G)"),
            mk("card-64g-a", "800I A2(64G)"),
            mk("card-64g-b", "800I A2(64G)"),
        ])
        .await;

    let mut hardware_role_map = HashMap::new();
    hardware_role_map.insert("800I A2(32G)".to_string(), InstanceRole::Prefill);
    hardware_role_map.insert("800I A2(64G)".to_string(), InstanceRole::Decode);

    let manager = manager_with(
        resource_registry.clone(),
        RoleManagerMode::Heterogeneous { hardware_role_map },
        None,
        FixedAbility { p_ability: 1.0, d_ability: 1.0 },
    );
    manager.run_once().await.expect("role assignment period");

    let roles = roles_by_id(&resource_registry).await;
    assert_eq!(roles["card-32g-a"], InstanceRole::Prefill);
    assert_eq!(roles["card-32g-b"], InstanceRole::Prefill);
    assert_eq!(roles["card-64g-a"], InstanceRole::Decode);
    assert_eq!(roles["card-64g-b"], InstanceRole::Decode);
}

/// Cross-node-asymmetric mode never assigns or touches roles -- the
/// placement is already fixed outside the role manager.
#[tokio::test]
async fn cross_node_asymmetric_mode_leaves_roles_untouched() {
    let resource_registry = Arc::new(ResourceRegistry::new(Duration::from_millis(200)));
    resource_registry
        .register_instances(vec![
            instance("i0", "g1", InstanceLabel::PrefillPrefer),
            instance("i1", "g1", InstanceLabel::DecodePrefer),
        ])
        .await;

    let manager = manager_with(
        resource_registry.clone(),
        RoleManagerMode::CrossNodeAsymmetric,
        None,
        FixedAbility { p_ability: 1.0, d_ability: 1.0 },
    );
    manager.run_once().await.expect("role assignment period");

    let roles = roles_by_id(&resource_registry).await;
    assert_eq!(roles["i0"], InstanceRole::Unset);
    assert_eq!(roles["i1"], InstanceRole::Unset);
}
