//! Capability registry, audit hook and shared-resource handles.

pub mod audit;
pub mod audited;
pub mod handle;
pub mod registry;

pub use audit::{AuditEntry, AuditLog, AuditOutcome, AuditSink, CallTicket, TracingAuditSink};
pub use audited::AuditedDispatcher;
pub use handle::{ExclusiveResource, HeldLease, ResourceLease, SharedResource};
pub use registry::{
    CapabilityHandler, CapabilityRegistry, ParamType, ParameterSpec, ToolDefinition, ToolInfo,
};
