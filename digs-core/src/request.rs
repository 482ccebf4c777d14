//! Request lifecycle state machine, grounded on `digs_request.h`/`.cpp`
//! and `req_schedule_info.h`.

use crate::error::{DigsError, DigsResult};
use crate::meta_resource::MetaResource;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DIGSReqState {
    Invalid = 0,
    Waiting = 1,
    Scheduling = 2,
    Allocated = 3,
    PrefillEnd = 4,
    DecodeEnd = 5,
}

impl DIGSReqState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DIGSReqState::Invalid,
            1 => DIGSReqState::Waiting,
            2 => DIGSReqState::Scheduling,
            3 => DIGSReqState::Allocated,
            4 => DIGSReqState::PrefillEnd,
            _ => DIGSReqState::DecodeEnd,
        }
    }
}

/// Controller operations dispatched from the release callback, matching
/// `DIGSReqOperation` / `GetRequestControlCallback`'s two cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DIGSReqOperation {
    Update,
    Remove,
}

/// Which stage(s) a release event should be propagated to. `ProcessRelease`
/// dispatches on this to decide whether to release prefill demand, decode
/// demand, or both (the decode-end fallthrough case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStage {
    Prefill,
    Decode,
    Both,
}

/// Per-request scheduling assignment: which instances were selected and
/// the once-only release latches backing invariant I2 (each stage's
/// demand is released at most once).
#[derive(Debug)]
pub struct ReqScheduleInfo {
    pub req_id: Arc<str>,
    group_id: RwLock<Option<String>>,
    prefill_inst: RwLock<Option<String>>,
    decode_inst: RwLock<Option<String>>,
    demand: RwLock<MetaResource>,
    prefill_released: AtomicBool,
    decode_released: AtomicBool,
    schedule_time: RwLock<Option<std::time::Instant>>,
}

impl ReqScheduleInfo {
    pub fn new(req_id: Arc<str>, demand: MetaResource) -> Self {
        Self {
            req_id,
            group_id: RwLock::new(None),
            prefill_inst: RwLock::new(None),
            decode_inst: RwLock::new(None),
            demand: RwLock::new(demand),
            prefill_released: AtomicBool::new(false),
            decode_released: AtomicBool::new(false),
            schedule_time: RwLock::new(Some(std::time::Instant::now())),
        }
    }

    pub fn demand(&self) -> MetaResource {
        self.demand.read().expect("lock poisoned").clone()
    }

    pub fn group_id(&self) -> Option<String> {
        self.group_id.read().expect("lock poisoned").clone()
    }

    pub fn prefill_inst(&self) -> Option<String> {
        self.prefill_inst.read().expect("lock poisoned").clone()
    }

    pub fn decode_inst(&self) -> Option<String> {
        self.decode_inst.read().expect("lock poisoned").clone()
    }

    pub fn set_prefill_inst(&self, group_id: String, inst: String) {
        *self.group_id.write().expect("lock poisoned") = Some(group_id);
        *self.prefill_inst.write().expect("lock poisoned") = Some(inst);
    }

    pub fn set_decode_inst(&self, inst: String) {
        *self.decode_inst.write().expect("lock poisoned") = Some(inst);
    }

    /// Returns `true` only the first time it's called (single-use latch).
    pub fn prefill_release(&self) -> bool {
        self.prefill_released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn decode_release(&self) -> bool {
        self.decode_released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_prefill_released(&self) -> bool {
        self.prefill_released.load(Ordering::SeqCst)
    }
}

/// A single inference request moving through the admission/allocation
/// state machine. Not cloneable: every registry holds it behind an `Arc`.
#[derive(Debug)]
pub struct Request {
    pub req_id: Arc<str>,
    pub input_len: u64,
    pub group_id: Option<String>,
    state: AtomicU8,
    output_len: AtomicU64,
    /// Externally supplied prefix-match length (e.g. from an inference
    /// engine's own KV-cache lookup) used by the MPRF reordering policy.
    /// Actual cache transfer/placement is out of scope here; this is just
    /// the ranking signal.
    prefix_match_len: AtomicU64,
    schedule_info: RwLock<Option<Arc<ReqScheduleInfo>>>,
    pub created_at: std::time::Instant,
}

impl Request {
    pub fn new(req_id: impl Into<Arc<str>>, input_len: u64, group_id: Option<String>) -> Self {
        Self {
            req_id: req_id.into(),
            input_len,
            group_id,
            state: AtomicU8::new(DIGSReqState::Waiting as u8),
            output_len: AtomicU64::new(0),
            prefix_match_len: AtomicU64::new(0),
            schedule_info: RwLock::new(None),
            created_at: std::time::Instant::now(),
        }
    }

    pub fn prefix_match_len(&self) -> u64 {
        self.prefix_match_len.load(Ordering::SeqCst)
    }

    pub fn set_prefix_match_len(&self, len: u64) {
        self.prefix_match_len.store(len, Ordering::SeqCst);
    }

    pub fn output_len(&self) -> u64 {
        self.output_len.load(Ordering::SeqCst)
    }

    pub fn record_output_token(&self) {
        self.output_len.fetch_add(1, Ordering::SeqCst);
    }

    pub fn state(&self) -> DIGSReqState {
        DIGSReqState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: DIGSReqState) {
        self.state.store(s as u8, Ordering::SeqCst);
        tracing::debug!(req_id = %self.req_id, state = ?s, "request state transition");
    }

    pub fn schedule_info(&self) -> Option<Arc<ReqScheduleInfo>> {
        self.schedule_info.read().expect("lock poisoned").clone()
    }

    pub fn init_schedule_info(&self, demand: MetaResource) -> Arc<ReqScheduleInfo> {
        let info = Arc::new(ReqScheduleInfo::new(self.req_id.clone(), demand));
        *self.schedule_info.write().expect("lock poisoned") = Some(info.clone());
        info
    }

    /// `Waiting -> Scheduling`, performed when the request is pulled off
    /// the waiting queue for this tick.
    pub fn to_scheduling(&self) -> DigsResult<()> {
        match self.state() {
            DIGSReqState::Waiting => {
                self.set_state(DIGSReqState::Scheduling);
                Ok(())
            }
            other => Err(DigsError::StateError(format!(
                "cannot move request {} to Scheduling from {:?}",
                self.req_id, other
            ))),
        }
    }

    /// `Scheduling -> Allocated`, once both prefill and decode instances
    /// have been selected.
    pub fn to_allocated(&self) -> DigsResult<()> {
        match self.state() {
            DIGSReqState::Scheduling => {
                self.set_state(DIGSReqState::Allocated);
                Ok(())
            }
            other => Err(DigsError::StateError(format!(
                "cannot move request {} to Allocated from {:?}",
                self.req_id, other
            ))),
        }
    }

    /// `Allocated -> PrefillEnd`. Always releases prefill demand.
    pub fn to_prefill_end(&self) -> DigsResult<()> {
        match self.state() {
            DIGSReqState::Allocated => {
                self.set_state(DIGSReqState::PrefillEnd);
                Ok(())
            }
            other => Err(DigsError::StateError(format!(
                "cannot move request {} to PrefillEnd from {:?}",
                self.req_id, other
            ))),
        }
    }

    /// `{Allocated,PrefillEnd} -> DecodeEnd` (normal path, releases
    /// whichever stage wasn't released yet) or `Scheduling -> DecodeEnd`
    /// (timeout shortcut: no resources were ever granted, so no release).
    /// Returns the release stage to propagate, or `None` for the
    /// timeout-shortcut path.
    pub fn to_decode_end(&self) -> DigsResult<Option<ReleaseStage>> {
        match self.state() {
            DIGSReqState::Allocated => {
                self.set_state(DIGSReqState::DecodeEnd);
                Ok(Some(ReleaseStage::Both))
            }
            DIGSReqState::PrefillEnd => {
                self.set_state(DIGSReqState::DecodeEnd);
                Ok(Some(ReleaseStage::Decode))
            }
            DIGSReqState::Scheduling => {
                self.set_state(DIGSReqState::DecodeEnd);
                Ok(None)
            }
            other => Err(DigsError::StateError(format!(
                "cannot move request {} to DecodeEnd from {:?}",
                self.req_id, other
            ))),
        }
    }

    pub fn to_invalid(&self) {
        self.set_state(DIGSReqState::Invalid);
    }

    /// `Allocated -> Scheduling`: the `NotifyAllocation` callback reported
    /// failure, so the request goes back into the scheduling queue for
    /// another attempt. Callers are responsible for releasing the
    /// already-committed demand before calling this.
    pub fn revert_to_scheduling(&self) -> DigsResult<()> {
        match self.state() {
            DIGSReqState::Allocated => {
                self.set_state(DIGSReqState::Scheduling);
                Ok(())
            }
            other => Err(DigsError::StateError(format!(
                "cannot revert request {} to Scheduling from {:?}",
                self.req_id, other
            ))),
        }
    }

    /// Dispatches a controller operation the way
    /// `GetRequestControlCallback` does: `Update` drives the prefill-end
    /// transition, `Remove` drives the decode-end transition.
    pub fn apply_operation(&self, op: DIGSReqOperation) -> DigsResult<Option<ReleaseStage>> {
        match op {
            DIGSReqOperation::Update => self.to_prefill_end().map(|_| None),
            DIGSReqOperation::Remove => self.to_decode_end(),
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        let s = self.state();
        if !matches!(s, DIGSReqState::DecodeEnd | DIGSReqState::Invalid) {
            tracing::warn!(req_id = %self.req_id, state = ?s, "request dropped in unexpected state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let r = Request::new("r1", 100, None);
        assert_eq!(r.state(), DIGSReqState::Waiting);
        r.to_scheduling().unwrap();
        r.to_allocated().unwrap();
        r.to_prefill_end().unwrap();
        let stage = r.to_decode_end().unwrap();
        assert_eq!(stage, Some(ReleaseStage::Decode));
    }

    #[test]
    fn timeout_shortcut_skips_release() {
        let r = Request::new("r2", 100, None);
        r.to_scheduling().unwrap();
        let stage = r.to_decode_end().unwrap();
        assert_eq!(stage, None);
    }

    #[test]
    fn illegal_transition_rejected() {
        let r = Request::new("r3", 100, None);
        assert!(r.to_allocated().is_err());
        assert_eq!(r.state(), DIGSReqState::Waiting);
    }

    #[test]
    fn release_latch_fires_once() {
        let info = ReqScheduleInfo::new(Arc::from("r4"), MetaResource::default());
        assert!(info.prefill_release());
        assert!(!info.prefill_release());
    }
}
