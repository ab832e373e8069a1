use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityError, Dispatcher};

// ================================
// CodeSandbox Trait
// ================================

/// Code sandbox execution interface
///
/// Every backend (embedded interpreter, WASM, ...) implements this trait. A caller
/// that only depends on it can swap backends freely.
#[async_trait::async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Sandbox type identifier
    fn sandbox_type(&self) -> SandboxType;

    /// Supported language list
    fn supported_languages(&self) -> Vec<CodeLanguage>;

    /// How firmly the backend can enforce its deadline.
    fn cancellation(&self) -> CancellationGuarantee;

    /// Execute source against `dispatcher`, the only side-effecting surface the
    /// guest can reach.
    ///
    /// Always returns a complete [`ExecutionResult`]; failures are carried in
    /// `ExecutionResult::error`. Parse/compile failures are reported before the
    /// guest runs, so they can never be preceded by a dispatch.
    async fn execute(
        &self,
        request: SandboxRequest,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> ExecutionResult;

    /// Parse or compile without running anything.
    async fn validate(&self, source: &str) -> Result<(), SandboxError> {
        let _ = source;
        Ok(())
    }

    /// Health check
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Get resource usage stats
    async fn get_stats(&self) -> SandboxStats {
        SandboxStats::default()
    }
}

// ================================
// Enums
// ================================

/// Sandbox type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxType {
    /// Embedded JavaScript interpreter
    Interpreter,
    /// WebAssembly module
    Wasm,
}

/// Languages the backends accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLanguage {
    JavaScript,
    /// WebAssembly text or base64-encoded binary
    Wasm,
}

impl CodeLanguage {
    /// Map a fenced-block language tag onto a language.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "js" | "javascript" | "mjs" | "node" => Some(CodeLanguage::JavaScript),
            "wat" | "wast" | "wasm" | "webassembly" => Some(CodeLanguage::Wasm),
            _ => None,
        }
    }
}

/// Strength of a backend's deadline enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationGuarantee {
    /// The caller stops waiting at the deadline, but the worker may keep running
    /// until it reaches a dispatch boundary.
    BestEffort,
    /// The guest is trapped at the deadline (or when its step budget runs out).
    Structural,
}

/// Health status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

// ================================
// Request / Response
// ================================

/// Sandbox execution request
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Validated source
    pub source: String,

    /// Programming language
    pub language: CodeLanguage,

    /// Wall-clock budget
    pub timeout: Duration,

    /// Abstract step budget, honoured by metering backends only
    pub step_budget: Option<u64>,
}

impl SandboxRequest {
    pub fn new(source: impl Into<String>, language: CodeLanguage, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            language,
            timeout,
            step_budget: None,
        }
    }

    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = Some(budget);
        self
    }
}

/// Result of one execution attempt. Produced exactly once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Everything the guest printed, up to the point it stopped
    pub stdout: String,

    /// Whether the guest ran to completion without an unhandled fault
    pub success: bool,

    /// Failure cause, if any
    pub error: Option<SandboxError>,

    /// Wall-clock time spent
    pub duration: Duration,

    /// Abstract steps consumed (metering backends only)
    pub steps_used: Option<u64>,
}

impl ExecutionResult {
    pub fn succeeded(stdout: String, duration: Duration) -> Self {
        Self {
            stdout,
            success: true,
            error: None,
            duration,
            steps_used: None,
        }
    }

    pub fn failed(error: SandboxError, stdout: String, duration: Duration) -> Self {
        Self {
            stdout,
            success: false,
            error: Some(error),
            duration,
            steps_used: None,
        }
    }

    /// Result for a program that was stopped before it ever ran.
    pub fn rejected(error: SandboxError) -> Self {
        Self::failed(error, String::new(), Duration::ZERO)
    }

    pub fn with_steps(mut self, steps: Option<u64>) -> Self {
        self.steps_used = steps;
        self
    }

    /// Human-readable error text, empty on success.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }
}

/// Sandbox statistics
#[derive(Debug, Clone, Default)]
pub struct SandboxStats {
    /// Total executions
    pub total_executions: u64,

    /// Successful executions
    pub successful_executions: u64,

    /// Failed executions (including rejections)
    pub failed_executions: u64,

    /// Executions stopped by a deadline or step budget
    pub timed_out_executions: u64,

    /// Average execution time
    pub avg_execution_time: Duration,
}

impl SandboxStats {
    /// Fold one finished execution into the running totals.
    pub fn record(&mut self, result: &ExecutionResult) {
        self.total_executions += 1;
        if result.success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
            if result.error.as_ref().is_some_and(SandboxError::is_timeout) {
                self.timed_out_executions += 1;
            }
        }
        if self.total_executions == 1 {
            self.avg_execution_time = result.duration;
        } else {
            let total_ns = self.avg_execution_time.as_nanos() as u64
                * (self.total_executions - 1)
                + result.duration.as_nanos() as u64;
            self.avg_execution_time = Duration::from_nanos(total_ns / self.total_executions);
        }
    }
}

// ================================
// Errors
// ================================

/// Execution error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxError {
    #[error("No usable source found in response")]
    ExtractionEmpty,

    #[error("Validation rejected: {reason}")]
    ValidationRejected { reason: String },

    #[error("Execution policy rejected: {reason}")]
    PolicyRejected { reason: String },

    #[error("Parse error: {message}")]
    ParseError { message: String },

    #[error("Runtime error: {message}")]
    RuntimeError { message: String },

    #[error("Execution timeout after {budget_ms}ms")]
    TimeoutExceeded { budget_ms: u64 },

    #[error("Step budget of {budget} exhausted")]
    StepLimitExceeded { budget: u64 },

    #[error("Capability not found: {name}")]
    CapabilityNotFound { name: String },

    #[error("Capability '{name}' failed: {message}")]
    CapabilityError { name: String, message: String },

    #[error("Unsupported language: {language:?}")]
    UnsupportedLanguage { language: CodeLanguage },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SandboxError {
    pub fn internal(message: impl ToString) -> Self {
        SandboxError::Internal {
            message: message.to_string(),
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        SandboxError::TimeoutExceeded {
            budget_ms: budget.as_millis() as u64,
        }
    }

    /// Deadline or step budget exhausted.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SandboxError::TimeoutExceeded { .. } | SandboxError::StepLimitExceeded { .. }
        )
    }

    /// Failures that stop a program before it can cause any side effect.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            SandboxError::ExtractionEmpty
                | SandboxError::ValidationRejected { .. }
                | SandboxError::PolicyRejected { .. }
                | SandboxError::ParseError { .. }
                | SandboxError::UnsupportedLanguage { .. }
        )
    }
}

impl From<CapabilityError> for SandboxError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::NotFound { name } => SandboxError::CapabilityNotFound { name },
            other => SandboxError::CapabilityError {
                name: other.name().to_string(),
                message: other.to_string(),
            },
        }
    }
}
