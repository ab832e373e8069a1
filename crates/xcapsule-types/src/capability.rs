//! The dispatch boundary between a sandboxed guest and the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single function through which guest code reaches the outside world.
///
/// Implementations are invoked synchronously on the guest's worker thread; the
/// guest is blocked until the call returns.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, name: &str, args: Value) -> Result<Value, CapabilityError>;
}

impl<F> Dispatcher for F
where
    F: Fn(&str, Value) -> Result<Value, CapabilityError> + Send + Sync,
{
    fn dispatch(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        self(name, args)
    }
}

/// Errors a capability call hands back to the guest.
///
/// These are ordinary values: the guest may handle them and carry on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("CapabilityNotFound: {name}")]
    NotFound { name: String },

    #[error("Invalid arguments for '{name}': {message}")]
    InvalidArguments { name: String, message: String },

    #[error("Capability '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("Capability '{name}' refused: execution cancelled")]
    Cancelled { name: String },
}

impl CapabilityError {
    pub fn name(&self) -> &str {
        match self {
            CapabilityError::NotFound { name }
            | CapabilityError::InvalidArguments { name, .. }
            | CapabilityError::Failed { name, .. }
            | CapabilityError::Cancelled { name } => name,
        }
    }

    /// Status code used across the WASM host boundary.
    pub fn status_code(&self) -> i32 {
        match self {
            CapabilityError::Failed { .. } => 1,
            CapabilityError::NotFound { .. } => 2,
            CapabilityError::InvalidArguments { .. } => 3,
            CapabilityError::Cancelled { .. } => 4,
        }
    }
}
