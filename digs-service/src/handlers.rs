//! HTTP surface over the registries: the inbound RPCs from `spec.md` §6,
//! given a concrete (if informal) JSON wire format since the original
//! leaves that to "the collaborator gRPC/HTTP layer". Handler bodies stay
//! thin -- all the actual logic lives in the registries and scheduler.

use crate::error::ServiceError;
use crate::state::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::http::StatusCode;
use digs_core::instance::{InstanceLabel, ResourceInfo, ResourceLoad, StaticInfo};
use digs_core::meta_resource::MetaResource;
use digs_core::registry::resource_registry::RegisterOutcome;
use digs_core::request::{DIGSReqOperation, Request as DigsRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstanceEntry {
    pub instance_id: String,
    pub group_id: String,
    pub address: String,
    pub label: InstanceLabel,
    pub hardware_type: String,
    #[serde(default)]
    pub peers: Vec<String>,
    pub max_connection_num: u64,
    pub attr_names: Vec<String>,
    pub total_resource: Vec<u64>,
    #[serde(default)]
    pub max_res_rate: Option<f64>,
    pub avail_slots_num: u64,
    pub avail_block_num: u64,
    pub max_avail_block_num: u64,
    pub total_block_num: u64,
}

pub async fn register_instances(
    State(state): State<AppState>,
    Json(entries): Json<Vec<RegisterInstanceEntry>>,
) -> Json<RegisterOutcome> {
    let built = entries
        .into_iter()
        .map(|e| {
            let static_info = StaticInfo {
                instance_id: e.instance_id,
                group_id: e.group_id,
                address: e.address,
                label: e.label,
                hardware_type: e.hardware_type,
                peers: e.peers,
                max_connection_num: e.max_connection_num,
                attr_names: e.attr_names,
            };
            let total_resource = MetaResource::from_attrs(e.total_resource);
            let info = ResourceInfo::new(static_info, total_resource, e.max_res_rate.unwrap_or(1.0));
            let load = ResourceLoad {
                avail_slots_num: e.avail_slots_num,
                avail_block_num: e.avail_block_num,
                max_avail_block_num: e.max_avail_block_num,
                total_block_num: e.total_block_num,
            };
            (info, load)
        })
        .collect();
    Json(state.resource_registry.register_instances(built).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceEntry {
    pub instance_id: String,
    pub total_resource: Vec<u64>,
    pub avail_slots_num: u64,
    pub avail_block_num: u64,
    pub max_avail_block_num: u64,
    pub total_block_num: u64,
}

#[derive(Debug, Serialize, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub async fn update_instances(State(state): State<AppState>, Json(entries): Json<Vec<UpdateInstanceEntry>>) -> Json<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    for e in entries {
        let load = ResourceLoad {
            avail_slots_num: e.avail_slots_num,
            avail_block_num: e.avail_block_num,
            max_avail_block_num: e.max_avail_block_num,
            total_block_num: e.total_block_num,
        };
        let total_resource = MetaResource::from_attrs(e.total_resource);
        match state.resource_registry.update_instance(&e.instance_id, load, total_resource).await {
            Ok(()) => outcome.succeeded.push(e.instance_id),
            Err(err) => outcome.failed.push((e.instance_id, err.to_string())),
        }
    }
    Json(outcome)
}

#[derive(Debug, Deserialize)]
pub struct IdList {
    pub ids: Vec<String>,
}

pub async fn remove_instances(State(state): State<AppState>, Json(body): Json<IdList>) -> Json<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    for id in body.ids {
        match state.resource_registry.remove_instance(&id).await {
            Ok(()) => outcome.succeeded.push(id),
            Err(err) => outcome.failed.push((id, err.to_string())),
        }
    }
    Json(outcome)
}

pub async fn close_instances(State(state): State<AppState>, Json(body): Json<IdList>) -> Json<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    for id in body.ids {
        match state.resource_registry.close_instance(&id).await {
            Ok(()) => outcome.succeeded.push(id),
            Err(err) => outcome.failed.push((id, err.to_string())),
        }
    }
    Json(outcome)
}

pub async fn activate_instances(State(state): State<AppState>, Json(body): Json<IdList>) -> Json<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    for id in body.ids {
        match state.resource_registry.activate_instance(&id).await {
            Ok(()) => outcome.succeeded.push(id),
            Err(err) => outcome.failed.push((id, err.to_string())),
        }
    }
    Json(outcome)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcReqBody {
    pub id: String,
    pub prompt_len: u64,
    #[serde(default)]
    pub group_id: Option<String>,
}

pub async fn proc_req(State(state): State<AppState>, Json(body): Json<ProcReqBody>) -> Result<StatusCode, ServiceError> {
    let req = Arc::new(DigsRequest::new(body.id, body.prompt_len, body.group_id));
    state.request_registry.add_req(req).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateReqStage {
    PrefillEnd,
    DecodeEnd,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReqBody {
    pub id: String,
    pub stage: UpdateReqStage,
    #[serde(default)]
    pub output_len: Option<u64>,
}

pub async fn update_req(State(state): State<AppState>, Json(body): Json<UpdateReqBody>) -> Result<StatusCode, ServiceError> {
    let op = match body.stage {
        UpdateReqStage::PrefillEnd => DIGSReqOperation::Update,
        UpdateReqStage::DecodeEnd => DIGSReqOperation::Remove,
    };
    if let (Some(output_len), Some(req)) = (body.output_len, state.request_registry.get(&body.id).await) {
        for _ in 0..output_len {
            req.record_output_token();
        }
    }
    state.request_registry.apply_operation(&body.id, op).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceScheduleEntry {
    pub id: String,
    pub allocated_slots: u64,
    pub allocated_blocks: u64,
}

pub async fn query_instance_schedule_info(State(state): State<AppState>) -> Json<Vec<InstanceScheduleEntry>> {
    let snapshot = state.resource_registry.snapshot().await.unwrap_or_default();
    let entries = snapshot
        .into_iter()
        .map(|(info, _load, sched)| InstanceScheduleEntry {
            id: info.static_info.instance_id,
            allocated_slots: sched.prefill_demands().slots() + sched.decode_demands().slots(),
            allocated_blocks: sched.prefill_demands().blocks() + sched.decode_demands().blocks(),
        })
        .collect();
    Json(entries)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummaryResponse {
    pub avg_input: u64,
    pub avg_output: u64,
}

pub async fn query_request_summary(State(state): State<AppState>) -> Json<RequestSummaryResponse> {
    Json(RequestSummaryResponse {
        avg_input: state.request_registry.profiler.avg_input_length(),
        avg_output: state.request_registry.profiler.avg_output_length(),
    })
}

pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readiness(State(state): State<AppState>) -> Response {
    if state.is_serving() {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false, "reason": "not_leader" }))).into_response()
    }
}
