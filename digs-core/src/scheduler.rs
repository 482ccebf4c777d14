//! The two-task global scheduler: a 100ms-ticked scheduling loop and a
//! notify-dispatch loop, grounded on `global_scheduler.h`/`.cpp` and
//! `schedule_framework.h`/`.cpp`. Threads become `tokio::task`s; the
//! condvar-with-timeout wakeup becomes a `Notify` raced against an
//! `interval`.

use crate::error::DigsResult;
use crate::meta_resource::MetaResource;
use crate::policy::{PoolPolicy, ReorderPolicy, SelectPolicy};
use crate::registry::{RequestRegistry, ResourceRegistry, ResourceViewManager};
use crate::request::{ReleaseStage, Request};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// Demand for a fresh request: one slot plus `ceil(input_len / block_size)`
/// blocks, matching `ScheduleFramework::GenerateDemand`.
pub fn generate_demand(req: &Request, block_size: u64, attr_count: usize) -> MetaResource {
    let mut demand = MetaResource::with_attr_count(attr_count);
    let blocks = req.input_len.div_ceil(block_size.max(1));
    demand.set_at(crate::meta_resource::ATTR_BLOCKS, blocks);
    demand.update_tokens(req.input_len);
    demand
}

#[derive(Debug, Clone)]
pub enum AllocationEvent {
    Allocated {
        req_id: Arc<str>,
        prefill_inst: String,
        decode_inst: String,
    },
    Shutdown,
}

pub struct GlobalScheduler {
    resource_registry: Arc<ResourceRegistry>,
    view_manager: Arc<ResourceViewManager>,
    request_registry: Arc<RequestRegistry>,
    reorder_policy: Box<dyn ReorderPolicy>,
    pool_policy: Box<dyn PoolPolicy>,
    select_policy: Mutex<Box<dyn SelectPolicy>>,
    scheduling_reqs: Mutex<VecDeque<Arc<Request>>>,
    tick_interval: Duration,
    max_req_num_per_tick: usize,
    block_size: u64,
    attr_count: usize,
    notify: Notify,
    alloc_tx: mpsc::UnboundedSender<AllocationEvent>,
    running: AtomicBool,
}

impl GlobalScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource_registry: Arc<ResourceRegistry>,
        view_manager: Arc<ResourceViewManager>,
        request_registry: Arc<RequestRegistry>,
        reorder_policy: Box<dyn ReorderPolicy>,
        pool_policy: Box<dyn PoolPolicy>,
        select_policy: Box<dyn SelectPolicy>,
        tick_interval: Duration,
        max_req_num_per_tick: usize,
        block_size: u64,
        attr_count: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AllocationEvent>) {
        let (alloc_tx, alloc_rx) = mpsc::unbounded_channel();
        let sched = Arc::new(Self {
            resource_registry,
            view_manager,
            request_registry,
            reorder_policy,
            pool_policy,
            select_policy: Mutex::new(select_policy),
            scheduling_reqs: Mutex::new(VecDeque::new()),
            tick_interval,
            max_req_num_per_tick,
            block_size,
            attr_count,
            notify: Notify::new(),
            alloc_tx,
            running: AtomicBool::new(false),
        });
        (sched, alloc_rx)
    }

    /// Wakes the tick loop early -- called by `RequestRegistry`'s injected
    /// `notify_scheduler` closure when a new request is admitted.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Registering the allocation-notify callback is what launches both
    /// background tasks, matching `RegisterNotifyAllocation`.
    pub fn start(self: &Arc<Self>, on_allocation: impl Fn(AllocationEvent) + Send + Sync + 'static, mut alloc_rx: mpsc::UnboundedReceiver<AllocationEvent>) -> (JoinHandle<()>, JoinHandle<()>) {
        if self.running.swap(true, Ordering::SeqCst) {
            panic!("GlobalScheduler::start called twice");
        }

        let tick_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.tick_loop().await })
        };

        let dispatch_handle = tokio::spawn(async move {
            while let Some(event) = alloc_rx.recv().await {
                if matches!(event, AllocationEvent::Shutdown) {
                    break;
                }
                on_allocation(event);
            }
        });

        (tick_handle, dispatch_handle)
    }

    /// Rolls back a committed allocation when the `NotifyAllocation`
    /// callback reports failure: releases both stages' demand on their
    /// assigned instances, moves the request back to `Scheduling`, and
    /// re-enters it at the front of the persistent scheduling queue so the
    /// next tick retries it before any newly-pulled requests.
    pub async fn revert_allocation(&self, req: Arc<Request>) -> DigsResult<()> {
        self.view_manager.update_schedule_info(&req, ReleaseStage::Both)?;
        req.revert_to_scheduling()?;
        self.scheduling_reqs.lock().await.push_front(req);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.alloc_tx.send(AllocationEvent::Shutdown);
        self.notify.notify_one();
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.tick().await {
                tracing::warn!(?err, "scheduler tick skipped");
            }
        }
    }

    /// The six-step `ScheduleFramework::Scheduling` sequence: reorder,
    /// pool-schedule, load prefill view, schedule prefill, offload,
    /// pool-schedule again, load decode view, schedule decode, offload.
    async fn tick(&self) -> DigsResult<()> {
        self.view_manager.refresh(&self.resource_registry).await?;

        let pulled = self.request_registry.pull_request(self.max_req_num_per_tick).await;
        {
            let mut queue = self.scheduling_reqs.lock().await;
            queue.extend(pulled);
            let mut as_vec: Vec<Arc<Request>> = queue.drain(..).collect();
            self.reorder_policy.reorder(&mut as_vec);
            *queue = as_vec.into();
        }

        self.pool_policy.schedule_inst(&self.view_manager);
        let prefill_view = self.view_manager.current();
        let mut select = self.select_policy.lock().await;
        select.load_resource_view(&prefill_view);

        let allocated = self.schedule_prefill(&mut *select).await;
        select.offload_resource_view();

        self.pool_policy.schedule_inst(&self.view_manager);
        let decode_view = self.view_manager.current();
        select.load_resource_view(&decode_view);

        self.schedule_decode(&mut *select, allocated).await;
        select.offload_resource_view();
        drop(select);

        self.request_registry.process_release().await?;
        self.request_registry.process_ended_req().await;
        Ok(())
    }

    /// Pops the persistent scheduling queue front-to-back; a failed
    /// admission puts the request back at the front and stops the scan --
    /// the pool is sorted ascending by load, so nothing further down the
    /// queue could possibly fit either.
    async fn schedule_prefill(&self, select: &mut dyn SelectPolicy) -> Vec<Arc<Request>> {
        let mut allocated = Vec::new();
        let mut queue = self.scheduling_reqs.lock().await;

        loop {
            let Some(req) = queue.pop_front() else { break };

            if req.state() != crate::request::DIGSReqState::Scheduling {
                continue;
            }

            let demand = generate_demand(&req, self.block_size, self.attr_count);
            match select.select_prefill_inst(&demand) {
                Some((inst_id, group_id)) => {
                    let sched = req.init_schedule_info(demand);
                    sched.set_prefill_inst(group_id, inst_id);
                    allocated.push(req);
                }
                None => {
                    queue.push_front(req);
                    break;
                }
            }
        }
        allocated
    }

    /// Decode selection for everything admitted into prefill this tick.
    /// A decode failure rolls back the prefill demand (releasing it if not
    /// already released) and requeues the whole request at the back of the
    /// scheduling queue for next tick's retry.
    async fn schedule_decode(&self, select: &mut dyn SelectPolicy, allocated: Vec<Arc<Request>>) {
        for req in allocated {
            let Some(sched) = req.schedule_info() else { continue };
            let demand = sched.demand();
            let group_id = sched.group_id().unwrap_or_default();
            let prefill_inst = sched.prefill_inst().unwrap_or_default();

            match select.select_decode_inst(&group_id, &prefill_inst, &demand) {
                Some(decode_inst) => {
                    sched.set_decode_inst(decode_inst.clone());
                    if req.to_allocated().is_ok() {
                        let _ = self.alloc_tx.send(AllocationEvent::Allocated {
                            req_id: req.req_id.clone(),
                            prefill_inst: sched.prefill_inst().unwrap_or_default(),
                            decode_inst,
                        });
                    }
                }
                None => {
                    if sched.prefill_release() {
                        let _ = self.view_manager.update_schedule_info(&req, ReleaseStage::Prefill);
                    }
                    self.scheduling_reqs.lock().await.push_back(req);
                }
            }
        }
    }
}
