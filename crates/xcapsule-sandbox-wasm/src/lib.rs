pub mod host_functions;
pub mod sandbox;

pub use sandbox::{WasmSandbox, WasmSandboxConfig};
pub use wasmtime;
