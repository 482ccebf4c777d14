//! Outbound `NotifyAllocation`/`NotifyRoleDecision` callbacks. `spec.md` §6
//! pins down only the semantics, leaving the wire format to "the
//! collaborator gRPC/HTTP layer" -- this picks a plain HTTP POST to a
//! configured collector endpoint and keeps it behind a trait, the same
//! pluggable-external-dependency seam `EtcdOps`/`CredentialDecryptor` use
//! elsewhere in this workspace.

use crate::config::NotifyConfig;
use async_trait::async_trait;
use digs_core::request::ReqScheduleInfo;
use digs_rolemgr::RoleDecision;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait AllocationNotifier: Send + Sync {
    /// `true` maps to the original's `return == 0`; an unconfigured sink
    /// is treated as trivially successful rather than a failure.
    async fn notify_allocation(&self, sched: &ReqScheduleInfo) -> bool;

    /// Failure is logged only -- `spec.md` explicitly rules out retrying
    /// within the period.
    async fn notify_role_decisions(&self, decisions: &[RoleDecision]);
}

pub struct HttpNotifier {
    client: reqwest::Client,
    allocation_url: Option<String>,
    role_decision_url: Option<String>,
}

impl HttpNotifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
                .expect("build reqwest client"),
            allocation_url: config.allocation_url.clone(),
            role_decision_url: config.role_decision_url.clone(),
        }
    }
}

#[async_trait]
impl AllocationNotifier for HttpNotifier {
    async fn notify_allocation(&self, sched: &ReqScheduleInfo) -> bool {
        let Some(url) = &self.allocation_url else { return true };
        let body = json!({
            "reqId": sched.req_id.as_ref(),
            "groupId": sched.group_id(),
            "prefillInst": sched.prefill_inst(),
            "decodeInst": sched.decode_inst(),
        });
        match self.client.post(url).json(&body).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::warn!(url, error = %err, req_id = %sched.req_id, "notify_allocation callback failed");
                false
            }
        }
    }

    async fn notify_role_decisions(&self, decisions: &[RoleDecision]) {
        let Some(url) = &self.role_decision_url else { return };
        match self.client.post(url).json(decisions).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(url, status = %resp.status(), "notify_role_decisions rejected by collector");
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "notify_role_decisions callback failed");
            }
            Ok(_) => {}
        }
    }
}
