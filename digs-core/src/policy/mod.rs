pub mod pool;
pub mod reorder;
pub mod select;

pub use pool::{PoolPolicy, PoolPolicyKind, StaticPoolPolicy};
pub use reorder::{FcfsPolicy, MprfPolicy, ReorderPolicy, ReorderPolicyKind, SljfPolicy};
pub use select::{LoadBalancePolicy, SelectPolicy, SelectPolicyKind, StaticAllocPolicy};
