use std::sync::Arc;

use serde_json::Value;

use super::audit::{AuditLog, AuditOutcome};
use super::handle::HeldLease;
use super::registry::CapabilityRegistry;
use xcapsule_types::{CapabilityError, Dispatcher};

/// The dispatcher handed to sandboxes: every call goes through the audit log
/// before and after it reaches the registry.
///
/// Session leases live here rather than on the session. The guest worker owns
/// the last reference to its dispatcher, so a lease is released only once the
/// worker has actually stopped, even if the session gave up on it earlier.
pub struct AuditedDispatcher {
    registry: Arc<CapabilityRegistry>,
    log: Arc<AuditLog>,
    leases: Vec<HeldLease>,
}

impl AuditedDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, log: Arc<AuditLog>) -> Self {
        Self {
            registry,
            log,
            leases: Vec::new(),
        }
    }

    /// Keep `leases` alive for as long as this dispatcher is reachable.
    pub fn with_leases(mut self, leases: Vec<HeldLease>) -> Self {
        self.leases = leases;
        self
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn log(&self) -> &Arc<AuditLog> {
        &self.log
    }
}

impl Dispatcher for AuditedDispatcher {
    fn dispatch(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        let ticket = self
            .log
            .stage(name, args.clone())
            .ok_or_else(|| CapabilityError::Cancelled {
                name: name.to_string(),
            })?;

        let result = match args.as_object() {
            Some(map) => self.registry.call(name, map),
            None => Err(CapabilityError::InvalidArguments {
                name: name.to_string(),
                message: format!("arguments must be an object, got {}", json_kind(&args)),
            }),
        };

        let outcome = match &result {
            Ok(value) => AuditOutcome::Result(value.clone()),
            Err(err) => AuditOutcome::Error(err.to_string()),
        };
        self.log.complete(ticket, outcome);
        result
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
