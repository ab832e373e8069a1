//! Error types for the orchestration layer.
//!
//! - [`ConfigError`]: configuration loading and deny-rule compilation.
//! - [`RegistryError`]: capability registration.
//! - [`ResourceError`]: leases on shared singleton resources.
//!
//! Execution-time errors ([`SandboxError`], [`CapabilityError`]) live in
//! `xcapsule-types` so both backends can produce them.

use thiserror::Error;

pub use xcapsule_types::{CapabilityError, SandboxError};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),
    #[error("Invalid deny pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sandbox setup failed: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Capability registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Capability already registered: {name}")]
    DuplicateCapability { name: String },
    #[error("Invalid capability definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
}

/// Shared resource lease errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Resource '{name}' is leased by another session")]
    Busy { name: String },
    #[error("Resource '{name}' is closed")]
    Closed { name: String },
}
