//! End-to-end flow: raw model text in, [`SessionReport`] out.
//!
//! ```text
//! raw response -> SourceExtractor -> SafetyValidator -> ExecutionSession -> SessionReport
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{AuditSink, CapabilityRegistry, ExclusiveResource, TracingAuditSink};
use crate::config::XcapsuleConfig;
use crate::error::ConfigError;
use crate::extract::{ExtractedSource, SourceExtractor, DEFAULT_ENTRY_MARKERS};
use crate::sandbox::{Backend, SandboxManager};
use crate::session::{
    ExecutionPolicy, ExecutionSession, GeneratedProgram, SessionOptions, SessionReport,
};
use crate::validation::{SafetyValidator, ValidationOutcome, ValidatorConfig};
use xcapsule_types::SandboxError;

pub use crate::session::TrustLevel;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wall-clock budget per session
    pub default_timeout_ms: u64,
    /// Abstract step budget for metering backends (backend default if unset)
    pub step_budget: Option<u64>,
    /// Backend for responses without a recognised language tag
    pub default_backend: Backend,
    pub default_trust: TrustLevel,
    /// Refuse untrusted source on best-effort backends
    pub require_structural_cancellation_for_untrusted: bool,
    /// Markers the extractor uses to pick among several fenced blocks
    pub entry_markers: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            step_budget: None,
            default_backend: Backend::Interpreter,
            default_trust: TrustLevel::Trusted,
            require_structural_cancellation_for_untrusted: true,
            entry_markers: DEFAULT_ENTRY_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            require_structural_cancellation_for_untrusted: self
                .require_structural_cancellation_for_untrusted,
        }
    }
}

/// Per-run overrides
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub backend: Option<Backend>,
    pub timeout: Option<Duration>,
    pub step_budget: Option<u64>,
    pub trust: Option<TrustLevel>,
}

/// Result of a dry run: what would execute, and whether it would be allowed.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub program: GeneratedProgram,
    pub backend: Backend,
    pub validation: ValidationOutcome,
    /// Policy or parse failure, if validation passed
    pub error: Option<SandboxError>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.validation.ok && self.error.is_none()
    }
}

/// Extract, validate and run model-generated programs.
pub struct Pipeline {
    extractor: SourceExtractor,
    validator: SafetyValidator,
    sandboxes: Arc<SandboxManager>,
    registry: Arc<CapabilityRegistry>,
    config: PipelineConfig,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    exclusive: Vec<Arc<dyn ExclusiveResource>>,
}

impl Pipeline {
    pub fn builder(registry: Arc<CapabilityRegistry>) -> PipelineBuilder {
        PipelineBuilder::new(registry)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, raw_response: &str) -> SessionReport {
        self.run_with(raw_response, RunOptions::default()).await
    }

    pub async fn run_with(&self, raw_response: &str, options: RunOptions) -> SessionReport {
        let extracted = self.extractor.extract(raw_response);
        let backend = self.pick_backend(&extracted, options.backend);
        let program = GeneratedProgram::new(raw_response, extracted);

        let session = ExecutionSession::new(
            program,
            SessionOptions {
                language: backend.language(),
                timeout: options.timeout.unwrap_or_else(|| self.config.default_timeout()),
                step_budget: options.step_budget.or(self.config.step_budget),
                trust: options.trust.unwrap_or(self.config.default_trust),
            },
            self.registry.clone(),
            self.audit_sinks.clone(),
        );

        let Some(sandbox) = self.sandboxes.get(backend) else {
            return session.reject(SandboxError::UnsupportedLanguage {
                language: backend.language(),
            });
        };

        let mut leases = Vec::with_capacity(self.exclusive.len());
        for resource in &self.exclusive {
            match resource.acquire() {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    return session.reject(SandboxError::PolicyRejected {
                        reason: e.to_string(),
                    })
                }
            }
        }

        session
            .with_leases(leases)
            .run(&self.validator, &self.config.policy(), sandbox)
            .await
    }

    /// Extract and validate without executing anything.
    pub async fn check(&self, raw_response: &str, options: RunOptions) -> CheckReport {
        let extracted = self.extractor.extract(raw_response);
        let backend = self.pick_backend(&extracted, options.backend);
        let validation = self.validator.validate(&extracted.source);
        let mut program = GeneratedProgram::new(raw_response, extracted);

        let error = if validation.ok {
            program.validated = true;
            match self.sandboxes.get(backend) {
                None => Some(SandboxError::UnsupportedLanguage {
                    language: backend.language(),
                }),
                Some(sandbox) => {
                    let trust = options.trust.unwrap_or(self.config.default_trust);
                    match self.config.policy().check(trust, sandbox.as_ref()) {
                        Err(e) => Some(e),
                        Ok(()) => sandbox.validate(&program.extracted_source).await.err(),
                    }
                }
            }
        } else {
            None
        };

        CheckReport {
            program,
            backend,
            validation,
            error,
        }
    }

    fn pick_backend(&self, extracted: &ExtractedSource, requested: Option<Backend>) -> Backend {
        if let Some(backend) = requested {
            return backend;
        }
        match extracted.language_tag.as_deref() {
            Some(tag) => self.sandboxes.select(Some(tag)),
            None if Backend::sniff(&extracted.source) == Backend::Wasm => Backend::Wasm,
            None => self.sandboxes.default_backend(),
        }
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    registry: Arc<CapabilityRegistry>,
    config: XcapsuleConfig,
    sandboxes: Option<SandboxManager>,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    exclusive: Vec<Arc<dyn ExclusiveResource>>,
}

impl PipelineBuilder {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            config: XcapsuleConfig::default(),
            sandboxes: None,
            audit_sinks: vec![Arc::new(TracingAuditSink)],
            exclusive: Vec::new(),
        }
    }

    pub fn config(mut self, config: XcapsuleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.config.pipeline = config;
        self
    }

    pub fn validator_config(mut self, config: ValidatorConfig) -> Self {
        self.config.validator = config;
        self
    }

    /// Use a prebuilt sandbox manager instead of the built-in backends.
    pub fn sandbox_manager(mut self, manager: SandboxManager) -> Self {
        self.sandboxes = Some(manager);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks.push(sink);
        self
    }

    /// Replace the default tracing sink.
    pub fn audit_sinks(mut self, sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        self.audit_sinks = sinks;
        self
    }

    /// Lease `resource` for the duration of every session.
    pub fn exclusive_resource(mut self, resource: Arc<dyn ExclusiveResource>) -> Self {
        self.exclusive.push(resource);
        self
    }

    pub fn build(self) -> Result<Pipeline, ConfigError> {
        let validator = SafetyValidator::new(self.config.validator.clone())?;
        let sandboxes = match self.sandboxes {
            Some(manager) => manager,
            None => SandboxManager::new(self.config.sandbox_config())?,
        }
        .with_default_backend(self.config.pipeline.default_backend);

        Ok(Pipeline {
            extractor: SourceExtractor::new(self.config.pipeline.entry_markers.clone()),
            validator,
            sandboxes: Arc::new(sandboxes),
            registry: self.registry,
            config: self.config.pipeline,
            audit_sinks: self.audit_sinks,
            exclusive: self.exclusive,
        })
    }
}
