pub mod request_registry;
pub mod resource_registry;
pub mod resource_view;

pub use request_registry::{RequestProfiler, RequestRegistry, RequestSummary};
pub use resource_registry::ResourceRegistry;
pub use resource_view::{ResourceView, ResourceViewManager, ViewEntry};
