//! Waiting/processing request queues and the rolling length profiler,
//! grounded on `request_manager.h`/`.cpp` and `request_profiler.h`/`.cpp`.
//!
//! `RequestRegistry` takes its release-processor and notify-scheduler
//! hooks as constructor-injected closures rather than depending on the
//! resource view or scheduler directly -- the same decoupling the
//! original gets from `SetReleaseProcessor`/`SetNotifyScheduler`.

use crate::error::{DigsError, DigsResult};
use crate::request::{DIGSReqOperation, DIGSReqState, ReleaseStage, Request};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_MAX_SUMMARY_COUNT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestSummary {
    pub avg_input_length: u64,
    pub avg_output_length: u64,
}

/// Bounded rolling buffer of request lengths, drained every time a summary
/// is computed -- each role-manager period starts counting from zero.
pub struct RequestProfiler {
    input_lengths: Mutex<VecDeque<u64>>,
    output_lengths: Mutex<VecDeque<u64>>,
    max_summary_count: usize,
    avg_input_length: AtomicU64,
    avg_output_length: AtomicU64,
}

impl Default for RequestProfiler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUMMARY_COUNT)
    }
}

impl RequestProfiler {
    pub fn new(max_summary_count: usize) -> Self {
        Self {
            input_lengths: Mutex::new(VecDeque::new()),
            output_lengths: Mutex::new(VecDeque::new()),
            max_summary_count,
            avg_input_length: AtomicU64::new(0),
            avg_output_length: AtomicU64::new(0),
        }
    }

    pub async fn export_ended_req(&self, input_len: u64, output_len: u64) {
        let mut inputs = self.input_lengths.lock().await;
        inputs.push_back(input_len);
        if inputs.len() > self.max_summary_count {
            inputs.pop_front();
        }
        drop(inputs);
        let mut outputs = self.output_lengths.lock().await;
        outputs.push_back(output_len);
        if outputs.len() > self.max_summary_count {
            outputs.pop_front();
        }
    }

    /// Computes and caches the mean input/output length, then drains both
    /// buffers. Matches `RequestProfiler::CalculateSummary`.
    pub async fn calculate_summary(&self) -> RequestSummary {
        let mut inputs = self.input_lengths.lock().await;
        let mut outputs = self.output_lengths.lock().await;

        let avg_in = if inputs.is_empty() {
            0
        } else {
            inputs.iter().sum::<u64>() / inputs.len() as u64
        };
        let avg_out = if outputs.is_empty() {
            0
        } else {
            outputs.iter().sum::<u64>() / outputs.len() as u64
        };

        inputs.clear();
        outputs.clear();

        self.avg_input_length.store(avg_in, Ordering::SeqCst);
        self.avg_output_length.store(avg_out, Ordering::SeqCst);

        RequestSummary {
            avg_input_length: avg_in,
            avg_output_length: avg_out,
        }
    }

    pub fn avg_input_length(&self) -> u64 {
        self.avg_input_length.load(Ordering::SeqCst)
    }

    pub fn avg_output_length(&self) -> u64 {
        self.avg_output_length.load(Ordering::SeqCst)
    }
}

type ReleaseProcessor = dyn Fn(&Request, ReleaseStage) -> DigsResult<()> + Send + Sync;
type NotifyScheduler = dyn Fn(bool) + Send + Sync;

pub struct RequestRegistry {
    waiting_queue: Mutex<VecDeque<Arc<Request>>>,
    processing_queue: Mutex<Vec<Arc<Request>>>,
    by_id: Mutex<HashMap<Arc<str>, Arc<Request>>>,
    pub profiler: RequestProfiler,
    release_processor: Box<ReleaseProcessor>,
    notify_scheduler: Box<NotifyScheduler>,
}

impl RequestRegistry {
    pub fn new(
        release_processor: Box<ReleaseProcessor>,
        notify_scheduler: Box<NotifyScheduler>,
    ) -> Self {
        Self {
            waiting_queue: Mutex::new(VecDeque::new()),
            processing_queue: Mutex::new(Vec::new()),
            by_id: Mutex::new(HashMap::new()),
            profiler: RequestProfiler::default(),
            release_processor,
            notify_scheduler,
        }
    }

    /// Admits a new request. Rejects duplicates by id, marking the
    /// duplicate instance `Invalid` rather than queuing it twice.
    pub async fn add_req(&self, req: Arc<Request>) -> DigsResult<()> {
        let mut by_id = self.by_id.lock().await;
        if by_id.contains_key(&req.req_id) {
            req.to_invalid();
            return Err(DigsError::IllegalParameter(format!(
                "duplicate request id {}",
                req.req_id
            )));
        }
        by_id.insert(req.req_id.clone(), req.clone());
        drop(by_id);
        self.waiting_queue.lock().await.push_back(req);
        (self.notify_scheduler)(false);
        Ok(())
    }

    /// Pulls up to `max_req_num` requests off the waiting queue into
    /// `Scheduling`, moving them into the processing queue. Matches
    /// `RequestManager::PullRequest`.
    pub async fn pull_request(&self, max_req_num: usize) -> Vec<Arc<Request>> {
        let mut waiting = self.waiting_queue.lock().await;
        let mut processing = self.processing_queue.lock().await;
        let mut pulled = Vec::with_capacity(max_req_num.min(waiting.len()));
        while pulled.len() < max_req_num {
            let Some(req) = waiting.pop_front() else { break };
            if req.to_scheduling().is_err() {
                continue;
            }
            processing.push(req.clone());
            pulled.push(req);
        }
        pulled
    }

    /// Re-queues a request at the back of the waiting list for retry next
    /// tick (the decode-failure rollback path).
    pub async fn requeue(&self, req: Arc<Request>) {
        self.waiting_queue.lock().await.push_back(req);
    }

    pub async fn apply_operation(&self, req_id: &str, op: DIGSReqOperation) -> DigsResult<()> {
        let by_id = self.by_id.lock().await;
        let req = by_id
            .get(req_id)
            .ok_or_else(|| DigsError::ResourceNotFound(req_id.to_string()))?
            .clone();
        drop(by_id);
        req.apply_operation(op)?;
        Ok(())
    }

    pub async fn remove_callback(&self, req_id: &str) {
        self.by_id.lock().await.remove(req_id);
    }

    pub async fn get(&self, req_id: &str) -> Option<Arc<Request>> {
        self.by_id.lock().await.get(req_id).cloned()
    }

    /// Extracts every `DecodeEnd` request out of the processing queue,
    /// exporting its lengths to the profiler first. Matches
    /// `RequestManager::ProcessEndedReq`.
    pub async fn process_ended_req(&self) -> Vec<Arc<Request>> {
        let mut processing = self.processing_queue.lock().await;
        let mut ended = Vec::new();
        processing.retain(|req| {
            if req.state() == DIGSReqState::DecodeEnd {
                ended.push(req.clone());
                false
            } else {
                true
            }
        });
        drop(processing);
        for req in &ended {
            self.profiler.export_ended_req(req.input_len, req.output_len()).await;
            self.remove_callback(&req.req_id).await;
        }
        ended
    }

    /// Releases demand for any processing request that just transitioned
    /// into `PrefillEnd` or `DecodeEnd`, via the once-only latches on its
    /// `ReqScheduleInfo`. A request still `Allocated` (not yet ended) is
    /// left alone this tick -- this is the switch-with-fallthrough
    /// semantics of `RequestManager::ProcessRelease`, not a per-tick sweep.
    pub async fn process_release(&self) -> DigsResult<()> {
        let processing = self.processing_queue.lock().await.clone();
        for req in processing {
            let Some(sched) = req.schedule_info() else { continue };
            match req.state() {
                DIGSReqState::DecodeEnd => {
                    if sched.decode_release() {
                        (self.release_processor)(&req, ReleaseStage::Decode)?;
                    }
                    if sched.prefill_release() {
                        (self.release_processor)(&req, ReleaseStage::Prefill)?;
                    }
                }
                DIGSReqState::PrefillEnd => {
                    if sched.prefill_release() {
                        (self.release_processor)(&req, ReleaseStage::Prefill)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn waiting_len(&self) -> usize {
        self.waiting_queue.lock().await.len()
    }

    pub async fn processing_snapshot(&self) -> Vec<Arc<Request>> {
        self.processing_queue.lock().await.clone()
    }
}
