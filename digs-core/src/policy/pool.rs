//! Pool (re)assignment policy applied to global-pool instances before each
//! of the prefill/decode selection phases. Grounded on
//! `inst_pool_policy.h` and `static_pool_policy.h`/`.cpp`.

use crate::error::{DigsError, DigsResult};
use crate::registry::resource_view::ResourceViewManager;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolPolicyKind {
    Static = 1,
}

impl TryFrom<u32> for PoolPolicyKind {
    type Error = DigsError;

    /// `DYNAMIC` exists as an enum value in the original but was never
    /// implemented; rejecting it at config time (rather than silently
    /// falling back) avoids pretending a config choice did something it
    /// didn't.
    fn try_from(v: u32) -> DigsResult<Self> {
        match v {
            1 => Ok(PoolPolicyKind::Static),
            2 => Err(DigsError::IllegalParameter(
                "pool_type 2 (dynamic) is not implemented".into(),
            )),
            other => Err(DigsError::IllegalParameter(format!("unknown pool_type {other}"))),
        }
    }
}

pub trait PoolPolicy: Send + Sync {
    fn schedule_inst(&self, view: &ResourceViewManager);
}

#[derive(Debug, Default)]
pub struct StaticPoolPolicy;

impl PoolPolicy for StaticPoolPolicy {
    fn schedule_inst(&self, view: &ResourceViewManager) {
        view.apply_static_pool_policy();
    }
}
