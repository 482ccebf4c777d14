mod config;
mod error;
mod handlers;
mod notify;
mod state;

use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use config::ServiceConfig;
use digs_core::config::SchedulerConfig;
use digs_core::meta_resource::ResWeights;
use digs_core::policy::{self, LoadBalancePolicy, PoolPolicyKind, SelectPolicyKind, StaticAllocPolicy, StaticPoolPolicy};
use digs_core::registry::{RequestRegistry, ResourceRegistry, ResourceViewManager};
use digs_core::request::ReleaseStage;
use digs_core::scheduler::{AllocationEvent, GlobalScheduler};
use digs_leader::{EtcdClientOps, EtcdOps, LeaderLock};
use digs_rolemgr::cost_model::create_simulator;
use digs_rolemgr::{RoleDecision, RoleManager, RoleManagerConfig, RoleManagerMode};
use notify::{AllocationNotifier, HttpNotifier};
use state::AppState;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/liveness", get(handlers::liveness))
        .route("/readiness", get(handlers::readiness))
        .route("/v1/digs/instances", post(handlers::register_instances))
        .route("/v1/digs/instances", put(handlers::update_instances))
        .route("/v1/digs/instances", delete(handlers::remove_instances))
        .route("/v1/digs/instances/close", post(handlers::close_instances))
        .route("/v1/digs/instances/activate", post(handlers::activate_instances))
        .route("/v1/digs/instances/schedule", get(handlers::query_instance_schedule_info))
        .route("/v1/digs/requests", post(handlers::proc_req))
        .route("/v1/digs/requests", patch(handlers::update_req))
        .route("/v1/digs/requests/summary", get(handlers::query_request_summary))
        .with_state(state)
}

fn role_manager_mode(role: &config::RoleConfig) -> RoleManagerMode {
    if role.is_skip_decision_for_cross_node_mode {
        RoleManagerMode::CrossNodeAsymmetric
    } else if role.is_heterogeneous {
        RoleManagerMode::Heterogeneous {
            hardware_role_map: role.hardware_role_map.clone(),
        }
    } else {
        RoleManagerMode::Normal
    }
}

/// Builds the whole scheduler/role-manager/leader-lock stack from a loaded
/// config, mirroring the gateway's `GatewayState::from_config` -- kept
/// separate from `main` so tests can build a real `AppState` without a
/// listening socket or an etcd cluster.
async fn build_state(config: &ServiceConfig) -> AppState {
    let SchedulerConfig {
        tick_interval_ms,
        max_req_num_per_tick,
        reorder_policy,
        pool_policy,
        select_policy,
        block_size,
    } = config.scheduler.clone();

    let attr_count = config.resource.attr_names.len().max(2);
    let weights = config
        .resource
        .res_weights
        .clone()
        .map(ResWeights::from_raw)
        .unwrap_or_else(|| ResWeights::default_for(attr_count));

    let resource_registry = Arc::new(ResourceRegistry::new(Duration::from_millis(config.resource.view_update_timeout_ms)));
    let view_manager = Arc::new(ResourceViewManager::new());

    let scheduler_cell: Arc<OnceLock<Arc<GlobalScheduler>>> = Arc::new(OnceLock::new());
    let notify_cell = scheduler_cell.clone();
    let request_registry = Arc::new(RequestRegistry::new(
        {
            let view_manager = view_manager.clone();
            Box::new(move |req: &digs_core::request::Request, stage: ReleaseStage| view_manager.update_schedule_info(req, stage))
        },
        Box::new(move |_: bool| {
            if let Some(scheduler) = notify_cell.get() {
                scheduler.wake();
            }
        }),
    ));

    let pool_policy_box: Box<dyn policy::PoolPolicy> = match pool_policy {
        PoolPolicyKind::Static => Box::new(StaticPoolPolicy),
    };
    let select_policy_box: Box<dyn policy::SelectPolicy> = match select_policy {
        SelectPolicyKind::StaticAlloc => Box::new(StaticAllocPolicy::new(weights.clone())),
        SelectPolicyKind::LoadBalance => Box::new(LoadBalancePolicy::new(weights.clone())),
    };

    let (scheduler, alloc_rx) = GlobalScheduler::new(
        resource_registry.clone(),
        view_manager.clone(),
        request_registry.clone(),
        policy::reorder::build(reorder_policy),
        pool_policy_box,
        select_policy_box,
        Duration::from_millis(tick_interval_ms),
        max_req_num_per_tick,
        block_size,
        attr_count,
    );
    scheduler_cell.set(scheduler.clone()).ok();

    let notifier: Arc<dyn AllocationNotifier> = Arc::new(HttpNotifier::new(&config.notify));

    {
        let request_registry = request_registry.clone();
        let notifier = notifier.clone();
        let scheduler_cell = scheduler_cell.clone();
        scheduler.start(
            move |event: AllocationEvent| {
                let AllocationEvent::Allocated { req_id, .. } = event else { return };
                let request_registry = request_registry.clone();
                let notifier = notifier.clone();
                let scheduler_cell = scheduler_cell.clone();
                tokio::spawn(async move {
                    let Some(req) = request_registry.get(&req_id).await else { return };
                    let Some(sched) = req.schedule_info() else { return };
                    if !notifier.notify_allocation(&sched).await {
                        if let Some(scheduler) = scheduler_cell.get() {
                            if let Err(err) = scheduler.revert_allocation(req).await {
                                warn!(?err, %req_id, "failed to revert allocation after notify failure");
                            }
                        }
                    }
                });
            },
            alloc_rx,
        );
    }

    let simulator_factory: Box<dyn Fn() -> Box<dyn digs_rolemgr::ModelSimulator> + Send + Sync> = {
        let model_family = config.cost_model.model_family.clone();
        let params = config.cost_model.params.clone();
        Box::new(move || create_simulator(&model_family, params.clone()).expect("build cost model simulator"))
    };

    let role_notifier = {
        let notifier = notifier.clone();
        Box::new(move |decisions: Vec<RoleDecision>| {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                notifier.notify_role_decisions(&decisions).await;
            });
        })
    };

    let role_manager = RoleManager::new(
        resource_registry.clone(),
        request_registry.clone(),
        RoleManagerConfig {
            time_period_s: config.role.time_period_s,
            mode: role_manager_mode(&config.role),
            ratio_type: if config.role.has_flex {
                digs_rolemgr::DIGSRatioType::PdFlex
            } else {
                digs_rolemgr::DIGSRatioType::Pd
            },
            pinned_rate: config.role.pinned_rate,
        },
        simulator_factory,
        role_notifier,
    );
    role_manager.start();

    let leader_lock = if config.leader.enabled {
        let ops = EtcdClientOps::connect(&config.leader.etcd_endpoints, Duration::from_secs(config.leader.rpc_timeout_s))
            .await
            .expect("connect to etcd for leader election");
        let lock = LeaderLock::new(
            Arc::new(ops) as Arc<dyn EtcdOps>,
            config.leader.lock_key.clone(),
            config.leader.client_id.clone(),
            config.leader.lease_ttl_s,
        );
        match lock.try_lock().await {
            Ok(true) => info!("acquired leader lock at startup"),
            Ok(false) => warn!("running as follower; scheduler writes are gated behind leader status"),
            Err(err) => warn!(?err, "leader lock acquisition attempt failed at startup"),
        }
        Some(lock)
    } else {
        None
    };

    AppState {
        resource_registry,
        request_registry,
        view_manager,
        scheduler: scheduler.clone(),
        role_manager,
        notifier,
        leader_lock,
        attr_count,
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServiceConfig::load().expect("load digs-service configuration");
    let state = build_state(&config).await;
    let scheduler = state.scheduler.clone();
    let app = build_app(state);

    info!(addr = %config.listen_addr, "starting digs-service");
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("bind digs-service listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("run digs-service server");

    scheduler.stop();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "ctrl_c handler error");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use digs_core::request::ReqScheduleInfo;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct NoopNotifier;

    #[async_trait]
    impl AllocationNotifier for NoopNotifier {
        async fn notify_allocation(&self, _sched: &ReqScheduleInfo) -> bool {
            true
        }

        async fn notify_role_decisions(&self, _decisions: &[RoleDecision]) {}
    }

    /// Same stack `build_state` assembles, but with a no-op notifier and no
    /// leader lock, so tests never touch the network or etcd.
    async fn test_state() -> AppState {
        let mut state = build_state(&ServiceConfig::default()).await;
        state.notifier = Arc::new(NoopNotifier);
        state
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("read body");
        serde_json::from_slice(&bytes).expect("parse json body")
    }

    #[tokio::test]
    async fn liveness_reports_ok() {
        let app = build_app(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_is_ok_without_leader_election() {
        let app = build_app(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/readiness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Never actually called in this test -- `LeaderLock::new` starts
    /// unlocked, and readiness is checked before any `try_lock` attempt.
    struct UnreachableEtcd;

    #[async_trait]
    impl EtcdOps for UnreachableEtcd {
        async fn try_create_lock(&self, _key: &str, _value: &str, _lease_id: i64) -> digs_leader::LeaderLockResult<bool> {
            unreachable!("readiness test never calls try_lock")
        }

        async fn read_current_holder(&self, _key: &str) -> digs_leader::LeaderLockResult<Option<(String, i64)>> {
            unreachable!("readiness test never calls try_lock")
        }

        async fn grant_lease(&self, _ttl_secs: i64) -> digs_leader::LeaderLockResult<i64> {
            unreachable!("readiness test never calls try_lock")
        }

        async fn keep_alive_once(&self, _lease_id: i64) -> digs_leader::LeaderLockResult<i64> {
            unreachable!("readiness test never calls try_lock")
        }

        async fn revoke_lease(&self, _lease_id: i64) -> digs_leader::LeaderLockResult<()> {
            unreachable!("readiness test never calls try_lock")
        }

        async fn key_exists(&self, _key: &str) -> digs_leader::LeaderLockResult<bool> {
            unreachable!("readiness test never calls try_lock")
        }
    }

    #[tokio::test]
    async fn readiness_is_unavailable_when_not_serving() {
        let mut state = test_state().await;
        let ops = Arc::new(UnreachableEtcd) as Arc<dyn EtcdOps>;
        state.leader_lock = Some(LeaderLock::new(ops, "digs/leader".into(), "node-a".into(), 10));
        let app = build_app(state);
        let response = app
            .oneshot(Request::builder().uri("/readiness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    fn sample_instance(id: &str) -> Value {
        json!({
            "instanceId": id,
            "groupId": "group-a",
            "address": "127.0.0.1:9000",
            "label": "PrefillPrefer",
            "hardwareType": "h100",
            "peers": [],
            "maxConnectionNum": 64,
            "attrNames": ["slots", "blocks"],
            "totalResource": [64, 1024],
            "availSlotsNum": 64,
            "availBlockNum": 1024,
            "maxAvailBlockNum": 1024,
            "totalBlockNum": 1024,
        })
    }

    #[tokio::test]
    async fn register_then_query_schedule_info_round_trips() {
        let app = build_app(test_state().await);

        let register = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/digs/instances")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&vec![sample_instance("inst-1")]).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(register.status(), StatusCode::OK);
        let outcome = body_json(register).await;
        assert_eq!(outcome["registered"], 1);
        assert_eq!(outcome["failed"], 0);

        let schedule = app
            .oneshot(Request::builder().uri("/v1/digs/instances/schedule").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(schedule.status(), StatusCode::OK);
        let entries = body_json(schedule).await;
        let entries = entries.as_array().expect("array body");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], "inst-1");
        assert_eq!(entries[0]["allocatedSlots"], 0);
    }

    #[tokio::test]
    async fn proc_req_admits_a_new_request() {
        let app = build_app(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/digs/requests")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({ "id": "req-1", "promptLen": 128 })).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn proc_req_rejects_duplicate_ids() {
        let app = build_app(test_state().await);
        let body = || Body::from(serde_json::to_vec(&json!({ "id": "req-dup", "promptLen": 16 })).unwrap());

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/digs/requests")
                    .header("content-type", "application/json")
                    .body(body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/digs/requests")
                    .header("content-type", "application/json")
                    .body(body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }
}
