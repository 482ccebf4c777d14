//! Request reordering policies applied to the scheduling batch pulled off
//! the waiting queue each tick. All are stable sorts, grounded on
//! `fcfs_policy.*`, `sljf_policy.*` and `mprf_policy.*`.

use crate::request::Request;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorderPolicyKind {
    Fcfs,
    Sjf,
    Ljf,
    Mprf,
}

pub trait ReorderPolicy: Send + Sync {
    fn reorder(&self, reqs: &mut [Arc<Request>]);
}

/// First-come-first-served: the waiting queue's own order is already
/// FIFO, so this is a no-op.
#[derive(Debug, Default)]
pub struct FcfsPolicy;

impl ReorderPolicy for FcfsPolicy {
    fn reorder(&self, _reqs: &mut [Arc<Request>]) {}
}

/// Shortest/longest-job-first, parameterized by direction -- one class
/// backs both SJF and LJF in the original (`SljfPolicy(bool isLjf)`).
#[derive(Debug)]
pub struct SljfPolicy {
    pub longest_first: bool,
}

impl SljfPolicy {
    pub fn sjf() -> Self {
        Self { longest_first: false }
    }

    pub fn ljf() -> Self {
        Self { longest_first: true }
    }
}

impl ReorderPolicy for SljfPolicy {
    fn reorder(&self, reqs: &mut [Arc<Request>]) {
        if self.longest_first {
            reqs.sort_by(|a, b| b.input_len.cmp(&a.input_len));
        } else {
            reqs.sort_by(|a, b| a.input_len.cmp(&b.input_len));
        }
    }
}

/// Most-prefix-reuse-first: stable sort descending by prefix match length.
#[derive(Debug, Default)]
pub struct MprfPolicy;

impl ReorderPolicy for MprfPolicy {
    fn reorder(&self, reqs: &mut [Arc<Request>]) {
        reqs.sort_by(|a, b| b.prefix_match_len().cmp(&a.prefix_match_len()));
    }
}

pub fn build(kind: ReorderPolicyKind) -> Box<dyn ReorderPolicy> {
    match kind {
        ReorderPolicyKind::Fcfs => Box::new(FcfsPolicy),
        ReorderPolicyKind::Sjf => Box::new(SljfPolicy::sjf()),
        ReorderPolicyKind::Ljf => Box::new(SljfPolicy::ljf()),
        ReorderPolicyKind::Mprf => Box::new(MprfPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: &str, len: u64) -> Arc<Request> {
        Arc::new(Request::new(id, len, None))
    }

    #[test]
    fn sjf_sorts_ascending_and_stable() {
        let mut reqs = vec![req("a", 30), req("b", 10), req("c", 10)];
        SljfPolicy::sjf().reorder(&mut reqs);
        assert_eq!(reqs[0].req_id.as_ref(), "b");
        assert_eq!(reqs[1].req_id.as_ref(), "c");
        assert_eq!(reqs[2].req_id.as_ref(), "a");
    }

    #[test]
    fn ljf_sorts_descending() {
        let mut reqs = vec![req("a", 10), req("b", 30)];
        SljfPolicy::ljf().reorder(&mut reqs);
        assert_eq!(reqs[0].req_id.as_ref(), "b");
    }

    #[test]
    fn fcfs_preserves_order() {
        let mut reqs = vec![req("a", 30), req("b", 10)];
        FcfsPolicy.reorder(&mut reqs);
        assert_eq!(reqs[0].req_id.as_ref(), "a");
    }
}
