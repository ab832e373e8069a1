pub mod capability;
pub mod guest;
pub mod sandbox;

pub use capability::{CapabilityError, Dispatcher};
pub use guest::GuestContext;
pub use sandbox::{
    CancellationGuarantee, CodeLanguage, CodeSandbox, ExecutionResult, HealthStatus,
    SandboxError, SandboxRequest, SandboxStats, SandboxType,
};
