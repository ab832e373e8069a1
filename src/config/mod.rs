//! Runtime configuration.
//!
//! Every section has defaults, so an empty document is a valid config and a
//! partial one only overrides what it names.

pub mod parser;

use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineConfig;
use crate::sandbox::SandboxManagerConfig;
use crate::validation::ValidatorConfig;

#[cfg(feature = "builtin-sandbox-js")]
use crate::sandbox::InterpreterSandboxConfig;
#[cfg(feature = "builtin-sandbox-wasm")]
use crate::sandbox::WasmSandboxConfig;

pub use parser::{load_config, parse_config, ConfigFormat};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XcapsuleConfig {
    pub validator: ValidatorConfig,
    #[cfg(feature = "builtin-sandbox-js")]
    pub interpreter: InterpreterSandboxConfig,
    #[cfg(feature = "builtin-sandbox-wasm")]
    pub wasm: WasmSandboxConfig,
    pub pipeline: PipelineConfig,
}

impl XcapsuleConfig {
    pub fn sandbox_config(&self) -> SandboxManagerConfig {
        SandboxManagerConfig {
            #[cfg(feature = "builtin-sandbox-js")]
            interpreter: self.interpreter.clone(),
            #[cfg(feature = "builtin-sandbox-wasm")]
            wasm: self.wasm.clone(),
        }
    }
}
