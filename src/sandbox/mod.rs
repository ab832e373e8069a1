//! Sandboxed execution
//!
//! Re-exports the backend contract from `xcapsule-types` and the built-in
//! backends enabled by features, plus the [`SandboxManager`] that picks one
//! per program.

pub mod manager;

pub use manager::{Backend, SandboxManager, SandboxManagerConfig};
pub use xcapsule_types::{
    CancellationGuarantee, CodeLanguage, CodeSandbox, ExecutionResult, GuestContext, HealthStatus,
    SandboxError, SandboxRequest, SandboxStats, SandboxType,
};

#[cfg(feature = "builtin-sandbox-js")]
pub use xcapsule_sandbox_js::{InterpreterSandbox, InterpreterSandboxConfig};
#[cfg(feature = "builtin-sandbox-wasm")]
pub use xcapsule_sandbox_wasm::{WasmSandbox, WasmSandboxConfig};
