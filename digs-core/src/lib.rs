pub mod config;
pub mod error;
pub mod instance;
pub mod meta_resource;
pub mod policy;
pub mod registry;
pub mod request;
pub mod scheduler;

pub use error::{DigsError, DigsResult};
pub use instance::{InstanceDuty, InstanceLabel, InstanceRole, ResScheduleInfo, ResourceInfo, ResourceLoad, StaticInfo};
pub use meta_resource::{compute_aware_load, get_token_sum, MetaResource, ResWeights};
pub use registry::{RequestProfiler, RequestRegistry, ResourceRegistry, ResourceView, ResourceViewManager};
pub use request::{DIGSReqOperation, DIGSReqState, ReleaseStage, ReqScheduleInfo, Request};
pub use scheduler::GlobalScheduler;
