//! One execution attempt, from validation to a terminal state.
//!
//! ```text
//! Created -> Validating -> Rejected
//!                       -> Validated -> Running -> Succeeded | Failed | TimedOut
//! ```
//!
//! A session is consumed by [`ExecutionSession::run`], so a terminal session
//! cannot be resumed; a retry builds a fresh session from fresh source.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::{
    AuditEntry, AuditLog, AuditSink, AuditedDispatcher, CapabilityRegistry, HeldLease,
};
use crate::extract::ExtractedSource;
use crate::validation::SafetyValidator;
use xcapsule_types::*;

/// A program pulled out of one model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedProgram {
    pub raw_response: String,
    pub extracted_source: String,
    pub language_tag: Option<String>,
    pub validated: bool,
}

impl GeneratedProgram {
    pub fn new(raw_response: impl Into<String>, extracted: ExtractedSource) -> Self {
        Self {
            raw_response: raw_response.into(),
            extracted_source: extracted.source,
            language_tag: extracted.language_tag,
            validated: false,
        }
    }

    /// A program whose source is used as-is.
    pub fn from_source(source: impl Into<String>, language_tag: Option<String>) -> Self {
        let source = source.into();
        Self {
            raw_response: source.clone(),
            extracted_source: source,
            language_tag,
            validated: false,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Validating,
    Rejected,
    Validated,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Rejected
                | SessionState::Succeeded
                | SessionState::Failed
                | SessionState::TimedOut
        )
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Validating, Rejected)
                | (Validating, Validated)
                | (Validated, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

/// Who wrote the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Untrusted,
}

/// Pre-execution policy checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Refuse untrusted source on a backend that cannot stop a runaway guest
    pub require_structural_cancellation_for_untrusted: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            require_structural_cancellation_for_untrusted: true,
        }
    }
}

impl ExecutionPolicy {
    pub fn check(&self, trust: TrustLevel, sandbox: &dyn CodeSandbox) -> Result<(), SandboxError> {
        if self.require_structural_cancellation_for_untrusted
            && trust == TrustLevel::Untrusted
            && sandbox.cancellation() == CancellationGuarantee::BestEffort
        {
            return Err(SandboxError::PolicyRejected {
                reason: format!(
                    "untrusted source requires structural cancellation; the {:?} backend is best-effort",
                    sandbox.sandbox_type()
                ),
            });
        }
        Ok(())
    }
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub language: CodeLanguage,
    pub timeout: Duration,
    pub step_budget: Option<u64>,
    pub trust: TrustLevel,
}

/// Outcome of one session. Callers always get one of these, even on rejection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub program: GeneratedProgram,
    pub state: SessionState,
    /// Every state the session passed through, in order
    pub transitions: Vec<SessionState>,
    pub backend: Option<SandboxType>,
    pub result: ExecutionResult,
    pub audit: Vec<AuditEntry>,
}

impl SessionReport {
    pub fn success(&self) -> bool {
        self.state == SessionState::Succeeded
    }
}

/// One execution attempt.
pub struct ExecutionSession {
    id: Uuid,
    program: GeneratedProgram,
    options: SessionOptions,
    registry: Arc<CapabilityRegistry>,
    audit: Arc<AuditLog>,
    state: SessionState,
    transitions: Vec<SessionState>,
    leases: Vec<HeldLease>,
}

impl ExecutionSession {
    pub fn new(
        program: GeneratedProgram,
        options: SessionOptions,
        registry: Arc<CapabilityRegistry>,
        audit_sinks: Vec<Arc<dyn AuditSink>>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            program,
            options,
            registry,
            audit: Arc::new(AuditLog::with_sinks(id.to_string(), audit_sinks)),
            state: SessionState::Created,
            transitions: vec![SessionState::Created],
            leases: Vec::new(),
        }
    }

    /// Resource leases to hold while the guest runs. They are handed to the
    /// guest's dispatcher, so they outlive the session if the worker does.
    pub fn with_leases(mut self, leases: Vec<HeldLease>) -> Self {
        self.leases = leases;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        self.transitions.push(next);
    }

    /// Validate, apply policy, parse, then run on `sandbox`.
    pub async fn run(
        mut self,
        validator: &SafetyValidator,
        policy: &ExecutionPolicy,
        sandbox: Arc<dyn CodeSandbox>,
    ) -> SessionReport {
        tracing::info!(
            session_id = %self.id,
            backend = ?sandbox.sandbox_type(),
            trust = ?self.options.trust,
            timeout_ms = self.options.timeout.as_millis() as u64,
            "session started"
        );

        self.transition(SessionState::Validating);
        let outcome = validator.validate(&self.program.extracted_source);
        if let Some(err) = outcome.to_error() {
            return self.finish_rejected(err, Some(sandbox.sandbox_type()));
        }
        self.program.validated = true;

        let checks = async {
            policy.check(self.options.trust, sandbox.as_ref())?;
            if !sandbox.supported_languages().contains(&self.options.language) {
                return Err(SandboxError::UnsupportedLanguage {
                    language: self.options.language,
                });
            }
            sandbox.validate(&self.program.extracted_source).await
        };
        if let Err(err) = checks.await {
            return self.finish_rejected(err, Some(sandbox.sandbox_type()));
        }
        self.transition(SessionState::Validated);

        self.transition(SessionState::Running);
        let dispatcher = Arc::new(
            AuditedDispatcher::new(self.registry.clone(), self.audit.clone())
                .with_leases(std::mem::take(&mut self.leases)),
        );
        let mut request = SandboxRequest::new(
            self.program.extracted_source.clone(),
            self.options.language,
            self.options.timeout,
        );
        request.step_budget = self.options.step_budget;

        let result = sandbox.execute(request, dispatcher).await;
        self.audit.seal();

        // Every refusal happens before Running; a backend that still reports
        // one from execute has failed the run.
        let next = match &result.error {
            None => SessionState::Succeeded,
            Some(e) if e.is_timeout() => SessionState::TimedOut,
            Some(_) => SessionState::Failed,
        };
        self.transition(next);
        self.finish(result, Some(sandbox.sandbox_type()))
    }

    /// Reject without running, e.g. when a required resource is busy.
    pub fn reject(mut self, error: SandboxError) -> SessionReport {
        self.transition(SessionState::Validating);
        self.finish_rejected(error, None)
    }

    fn finish_rejected(mut self, error: SandboxError, backend: Option<SandboxType>) -> SessionReport {
        tracing::warn!(session_id = %self.id, error = %error, "session rejected");
        self.transition(SessionState::Rejected);
        self.audit.seal();
        self.finish(ExecutionResult::rejected(error), backend)
    }

    fn finish(self, result: ExecutionResult, backend: Option<SandboxType>) -> SessionReport {
        if result.error.as_ref().is_some_and(SandboxError::is_timeout) {
            tracing::warn!(
                session_id = %self.id,
                error = %result.error_message(),
                "session timed out"
            );
        }
        let audit = self.audit.entries();
        tracing::info!(
            session_id = %self.id,
            state = ?self.state,
            success = result.success,
            calls = audit.len(),
            duration_ms = result.duration.as_millis() as u64,
            "session finished"
        );
        SessionReport {
            session_id: self.id,
            program: self.program,
            state: self.state,
            transitions: self.transitions,
            backend,
            result,
            audit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidatorConfig;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// Backend stub that dispatches a fixed script of calls and then returns
    /// a canned error, or succeeds.
    struct ScriptedSandbox {
        calls: Vec<(&'static str, Value)>,
        outcome: Option<SandboxError>,
        cancellation: CancellationGuarantee,
        parse_error: Option<SandboxError>,
        executed: Mutex<bool>,
    }

    impl ScriptedSandbox {
        fn new(calls: Vec<(&'static str, Value)>, outcome: Option<SandboxError>) -> Self {
            Self {
                calls,
                outcome,
                cancellation: CancellationGuarantee::Structural,
                parse_error: None,
                executed: Mutex::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl CodeSandbox for ScriptedSandbox {
        fn sandbox_type(&self) -> SandboxType {
            SandboxType::Interpreter
        }

        fn supported_languages(&self) -> Vec<CodeLanguage> {
            vec![CodeLanguage::JavaScript]
        }

        fn cancellation(&self) -> CancellationGuarantee {
            self.cancellation
        }

        async fn execute(
            &self,
            _request: SandboxRequest,
            dispatcher: Arc<dyn Dispatcher>,
        ) -> ExecutionResult {
            *self.executed.lock() = true;
            for (name, args) in &self.calls {
                let _ = dispatcher.dispatch(name, args.clone());
            }
            match &self.outcome {
                None => ExecutionResult::succeeded("done\n".into(), Duration::from_millis(1)),
                Some(e) => ExecutionResult::failed(e.clone(), String::new(), Duration::from_millis(1)),
            }
        }

        async fn validate(&self, _source: &str) -> Result<(), SandboxError> {
            match &self.parse_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_fn("echo", "", vec![], |args| Ok(Value::Object(args.clone())))
            .unwrap();
        Arc::new(registry)
    }

    fn session(source: &str, trust: TrustLevel) -> ExecutionSession {
        ExecutionSession::new(
            GeneratedProgram::from_source(source, Some("js".into())),
            SessionOptions {
                language: CodeLanguage::JavaScript,
                timeout: Duration::from_secs(1),
                step_budget: None,
                trust,
            },
            registry(),
            Vec::new(),
        )
    }

    fn validator() -> SafetyValidator {
        SafetyValidator::new(ValidatorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_success_path_states() {
        let sandbox = Arc::new(ScriptedSandbox::new(vec![("echo", json!({"msg": "hi"}))], None));
        let report = session("dispatch('echo', {msg: 'hi'})", TrustLevel::Trusted)
            .run(&validator(), &ExecutionPolicy::default(), sandbox)
            .await;

        assert_eq!(report.state, SessionState::Succeeded);
        assert_eq!(
            report.transitions,
            vec![
                SessionState::Created,
                SessionState::Validating,
                SessionState::Validated,
                SessionState::Running,
                SessionState::Succeeded
            ]
        );
        assert!(report.program.validated);
        assert_eq!(report.audit.len(), 1);
        assert_eq!(report.audit[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_denylisted_source_never_executes() {
        let sandbox = Arc::new(ScriptedSandbox::new(vec![("echo", json!({}))], None));
        let report = session("eval('1')", TrustLevel::Trusted)
            .run(&validator(), &ExecutionPolicy::default(), sandbox.clone())
            .await;

        assert_eq!(report.state, SessionState::Rejected);
        assert!(!*sandbox.executed.lock());
        assert!(report.audit.is_empty());
        assert!(!report.program.validated);
        assert!(matches!(report.result.error, Some(SandboxError::ValidationRejected { .. })));
    }

    #[tokio::test]
    async fn test_policy_refuses_untrusted_on_best_effort() {
        let mut stub = ScriptedSandbox::new(vec![("echo", json!({}))], None);
        stub.cancellation = CancellationGuarantee::BestEffort;
        let sandbox = Arc::new(stub);

        let report = session("print(1)", TrustLevel::Untrusted)
            .run(&validator(), &ExecutionPolicy::default(), sandbox.clone())
            .await;
        assert_eq!(report.state, SessionState::Rejected);
        assert!(matches!(report.result.error, Some(SandboxError::PolicyRejected { .. })));
        assert!(!*sandbox.executed.lock());

        let relaxed = ExecutionPolicy {
            require_structural_cancellation_for_untrusted: false,
        };
        let report = session("print(1)", TrustLevel::Untrusted)
            .run(&validator(), &relaxed, sandbox)
            .await;
        assert_eq!(report.state, SessionState::Succeeded);
    }

    #[tokio::test]
    async fn test_parse_error_is_rejected() {
        let mut stub = ScriptedSandbox::new(vec![], None);
        stub.parse_error = Some(SandboxError::ParseError { message: "bad".into() });
        let report = session("print(", TrustLevel::Trusted)
            .run(&validator(), &ExecutionPolicy::default(), Arc::new(stub))
            .await;
        assert_eq!(report.state, SessionState::Rejected);
        assert!(report.audit.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_keeps_prior_audit() {
        let sandbox = Arc::new(ScriptedSandbox::new(
            vec![("echo", json!({"n": 1})), ("echo", json!({"n": 2}))],
            Some(SandboxError::TimeoutExceeded { budget_ms: 1000 }),
        ));
        let report = session("loop()", TrustLevel::Trusted)
            .run(&validator(), &ExecutionPolicy::default(), sandbox)
            .await;
        assert_eq!(report.state, SessionState::TimedOut);
        assert_eq!(report.audit.len(), 2);
        assert!(!report.result.success);
    }

    #[tokio::test]
    async fn test_runtime_error_is_failed() {
        let sandbox = Arc::new(ScriptedSandbox::new(
            vec![("missing", json!({}))],
            Some(SandboxError::CapabilityNotFound { name: "missing".into() }),
        ));
        let report = session("x()", TrustLevel::Trusted)
            .run(&validator(), &ExecutionPolicy::default(), sandbox)
            .await;
        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.audit.len(), 1);
        assert!(report.audit[0].is_error());
    }

    #[tokio::test]
    async fn test_refusal_from_execute_is_failed() {
        let sandbox = Arc::new(ScriptedSandbox::new(
            vec![("echo", json!({}))],
            Some(SandboxError::PolicyRejected { reason: "late".into() }),
        ));
        let report = session("print(1)", TrustLevel::Trusted)
            .run(&validator(), &ExecutionPolicy::default(), sandbox)
            .await;

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.transitions.last(), Some(&SessionState::Failed));
        assert!(matches!(report.result.error, Some(SandboxError::PolicyRejected { .. })));
        assert_eq!(report.audit.len(), 1);
    }

    #[test]
    fn test_reject_without_sandbox() {
        let report = session("print(1)", TrustLevel::Trusted).reject(SandboxError::PolicyRejected {
            reason: "busy".into(),
        });
        assert_eq!(report.state, SessionState::Rejected);
        assert_eq!(report.backend, None);
        assert!(report.state.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        assert!(SessionState::Created.can_transition_to(SessionState::Validating));
        assert!(!SessionState::Created.can_transition_to(SessionState::Running));
        assert!(!SessionState::Succeeded.can_transition_to(SessionState::Running));
        assert!(!SessionState::Rejected.can_transition_to(SessionState::Validating));
        assert!(SessionState::Validating.can_transition_to(SessionState::Rejected));
        assert!(!SessionState::Validated.can_transition_to(SessionState::Rejected));
        assert!(!SessionState::Running.can_transition_to(SessionState::Rejected));
    }
}
