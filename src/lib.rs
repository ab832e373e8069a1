//! # xcapsule: run model-generated programs inside a bounded sandbox
//!
//! `xcapsule` takes source code produced by a language model and turns it into
//! a running program whose only side effects are calls into an explicitly
//! registered set of host capabilities. Every call is audited, and every run
//! is bounded by a wall-clock budget.
//!
//! - **Extraction**: pull the program out of a markdown response
//!   ([`extract_source`], [`SourceExtractor`]).
//! - **Validation**: a lexical deny-list screen before anything runs
//!   ([`validate`], [`SafetyValidator`]).
//! - **Capabilities**: a closed, typed registry reached through a single
//!   `dispatch(name, args)` surface ([`CapabilityRegistry`]).
//! - **Sandboxes**: an embedded JavaScript interpreter (best-effort
//!   cancellation) and a WebAssembly runtime (structural cancellation).
//! - **Sessions**: one audited execution attempt with a fixed lifecycle
//!   ([`ExecutionSession`], [`SessionReport`]).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use xcapsule::{CapabilityRegistry, ParameterSpec, ParamType, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = CapabilityRegistry::new();
//!     registry.register_fn(
//!         "echo",
//!         "Return the arguments unchanged",
//!         vec![ParameterSpec::optional("msg", ParamType::String)],
//!         |args: &serde_json::Map<String, Value>| Ok(Value::Object(args.clone())),
//!     )?;
//!
//!     let pipeline = Pipeline::builder(Arc::new(registry)).build()?;
//!     let report = pipeline
//!         .run("```js\ndispatch(\"echo\", {msg: \"hi\"});\n```")
//!         .await;
//!     assert!(report.success());
//!     assert_eq!(report.audit[0].args, json!({"msg": "hi"}));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! | Flag | Description |
//! |------|-------------|
//! | `builtin-sandbox-js` | Bundles the JavaScript interpreter backend (Boa engine) |
//! | `builtin-sandbox-wasm` | Bundles the WebAssembly backend (wasmtime) |

pub mod capability;
pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod sandbox;
pub mod session;
pub mod validation;

pub use crate::capability::{
    AuditEntry, AuditLog, AuditOutcome, AuditSink, AuditedDispatcher, CapabilityHandler,
    CapabilityRegistry, ExclusiveResource, HeldLease, ParamType, ParameterSpec, ResourceLease,
    SharedResource, ToolDefinition, ToolInfo, TracingAuditSink,
};
pub use crate::config::{load_config, parse_config, ConfigFormat, XcapsuleConfig};
pub use crate::error::{ConfigError, RegistryError, ResourceError};
pub use crate::extract::{extract_source, ExtractedSource, SourceExtractor};
pub use crate::pipeline::{CheckReport, Pipeline, PipelineBuilder, PipelineConfig, RunOptions};
pub use crate::sandbox::{Backend, SandboxManager, SandboxManagerConfig};
pub use crate::session::{
    ExecutionPolicy, ExecutionSession, GeneratedProgram, SessionOptions, SessionReport,
    SessionState, TrustLevel,
};
pub use crate::validation::{validate, SafetyValidator, ValidationOutcome, ValidatorConfig};
pub use xcapsule_types::{
    CancellationGuarantee, CapabilityError, CodeLanguage, CodeSandbox, Dispatcher,
    ExecutionResult, SandboxError, SandboxRequest, SandboxType,
};
