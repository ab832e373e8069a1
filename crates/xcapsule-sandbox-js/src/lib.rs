pub mod builtins;
pub mod sandbox;

pub use sandbox::{InterpreterSandbox, InterpreterSandboxConfig};

// Re-export boa_engine for consumers that need direct access
pub use boa_engine;
