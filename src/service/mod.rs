//! Methods the frontends dispatch to.
//!
//! - [`registry`] - method table with per-method access level
//! - [`workflow`] - in-memory workflow API plus the health check

pub mod registry;
pub mod workflow;

pub use registry::{
    MethodDescriptor, MethodKind, ServiceRegistry, StreamHandler, UnaryHandler, method_name,
};
pub use workflow::{WorkflowService, methods};

/// Registry holding the workflow API backed by `service`.
#[must_use]
pub fn default_registry(service: &std::sync::Arc<WorkflowService>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    service.register(&mut registry);
    registry
}
