//! Embedded JavaScript interpreter backend using boa_engine.
//!
//! Source is parsed and evaluated in-process against a pruned global object
//! holding only the host's `dispatch` binding, output-only printing and the
//! language intrinsics. There is no compile step, so startup cost is parse time.
//!
//! Cancellation is best-effort: evaluation runs on a dedicated worker thread and
//! the caller stops waiting at the deadline, but a tight loop with no dispatch
//! boundary keeps the worker busy until it ends (or until the optional loop
//! iteration limit trips).

use std::sync::Arc;
use std::time::{Duration, Instant};

use boa_engine::{Context, JsError, Script, Source};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};

use xcapsule_types::*;

/// Interpreter sandbox configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSandboxConfig {
    /// Max source length (bytes)
    pub max_code_length: usize,

    /// Max captured stdout (bytes)
    pub max_stdout_bytes: usize,

    /// Abort any single loop after this many iterations. Off by default: it
    /// caps loop length, not wall-clock time.
    pub loop_iteration_limit: Option<u64>,

    /// Max call depth
    pub recursion_limit: usize,

    /// Stack size of the worker thread (bytes)
    pub worker_stack_size: usize,

    /// Freeze the intrinsic prototypes before guest code runs
    pub freeze_prototypes: bool,

    /// Globals left visible to guest code
    pub allowed_globals: Vec<String>,
}

impl Default for InterpreterSandboxConfig {
    fn default() -> Self {
        Self {
            max_code_length: 1_000_000,
            max_stdout_bytes: 1024 * 1024,
            loop_iteration_limit: None,
            recursion_limit: 512,
            worker_stack_size: 16 * 1024 * 1024,
            freeze_prototypes: true,
            allowed_globals: [
                "JSON",
                "Math",
                "Number",
                "String",
                "Boolean",
                "Array",
                "Object",
                "Error",
                "TypeError",
                "RangeError",
                "SyntaxError",
                "ReferenceError",
                "Map",
                "Set",
                "Symbol",
                "Date",
                "RegExp",
                "parseInt",
                "parseFloat",
                "isNaN",
                "isFinite",
                "encodeURIComponent",
                "decodeURIComponent",
                "undefined",
                "NaN",
                "Infinity",
                "globalThis",
                "dispatch",
                "print",
                "console",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Wraps the raw host bindings into the guest-facing surface.
const PRELUDE: &str = r#"
var dispatch = (function (raw, stringify, parse) {
    return function dispatch(name, args) {
        var payload = stringify(args === undefined ? {} : args);
        return parse(raw(String(name), payload === undefined ? "{}" : payload));
    };
})(__host_dispatch, JSON.stringify, JSON.parse);

var print, console;
(function (write, stringify) {
    function render(values) {
        var parts = [];
        for (var i = 0; i < values.length; i++) {
            var v = values[i];
            if (v instanceof Error) {
                parts.push(String(v));
            } else if (typeof v === 'object' && v !== null) {
                try { parts.push(stringify(v)); } catch (e) { parts.push(String(v)); }
            } else {
                parts.push(String(v));
            }
        }
        return parts.join(' ') + '\n';
    }
    print = function () { write(render(arguments)); };
    console = { log: print, info: print, warn: print, error: print, debug: print };
})(__host_write, JSON.stringify);
"#;

const MAIN_INVOCATION: &str = "if (typeof main === 'function') { main(); }";

/// Embedded interpreter sandbox
pub struct InterpreterSandbox {
    config: InterpreterSandboxConfig,
    stats: Arc<RwLock<SandboxStats>>,
}

impl InterpreterSandbox {
    pub fn new(config: InterpreterSandboxConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RwLock::new(SandboxStats::default())),
        }
    }

    pub fn config(&self) -> &InterpreterSandboxConfig {
        &self.config
    }

    fn check_size(&self, source: &str) -> Result<(), SandboxError> {
        if source.len() > self.config.max_code_length {
            return Err(SandboxError::ValidationRejected {
                reason: format!(
                    "source is {} bytes, limit is {} bytes",
                    source.len(),
                    self.config.max_code_length
                ),
            });
        }
        Ok(())
    }

    async fn execute_inner(
        &self,
        request: SandboxRequest,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> ExecutionResult {
        let start_time = Instant::now();

        if request.language != CodeLanguage::JavaScript {
            return ExecutionResult::rejected(SandboxError::UnsupportedLanguage {
                language: request.language,
            });
        }
        if let Err(e) = self.check_size(&request.source) {
            return ExecutionResult::rejected(e);
        }

        let guest = GuestContext::new(dispatcher, self.config.max_stdout_bytes);
        let (done_tx, done_rx) = oneshot::channel();

        let worker_guest = guest.clone();
        let config = self.config.clone();
        let source = request.source;
        let spawned = std::thread::Builder::new()
            .name("xcapsule-js".into())
            .stack_size(config.worker_stack_size)
            .spawn(move || {
                let outcome = run_guest(&source, &worker_guest, &config);
                // Release the dispatcher (and any leases it holds) before reporting.
                drop(worker_guest);
                let _ = done_tx.send(outcome);
            });
        if let Err(e) = spawned {
            return ExecutionResult::failed(
                SandboxError::internal(format!("Failed to spawn worker: {}", e)),
                String::new(),
                start_time.elapsed(),
            );
        }

        match tokio::time::timeout(request.timeout, done_rx).await {
            Ok(Ok(Ok(()))) => ExecutionResult::succeeded(guest.stdout(), start_time.elapsed()),
            Ok(Ok(Err(e))) => ExecutionResult::failed(e, guest.stdout(), start_time.elapsed()),
            Ok(Err(_)) => ExecutionResult::failed(
                SandboxError::internal("worker exited without reporting a result"),
                guest.stdout(),
                start_time.elapsed(),
            ),
            Err(_) => {
                guest.cancel();
                tracing::warn!(
                    timeout_ms = request.timeout.as_millis() as u64,
                    "interpreter deadline reached; worker left to unwind at its next dispatch"
                );
                ExecutionResult::failed(
                    SandboxError::timeout(request.timeout),
                    guest.stdout(),
                    start_time.elapsed(),
                )
            }
        }
    }
}

/// Evaluate guest source on the current thread.
fn run_guest(
    source: &str,
    guest: &Arc<GuestContext>,
    config: &InterpreterSandboxConfig,
) -> Result<(), SandboxError> {
    let mut context = Context::default();
    if let Some(limit) = config.loop_iteration_limit {
        context.runtime_limits_mut().set_loop_iteration_limit(limit);
    }
    context
        .runtime_limits_mut()
        .set_recursion_limit(config.recursion_limit);

    crate::builtins::register_all(&mut context, guest.clone())
        .map_err(|e| SandboxError::internal(format!("Failed to register builtins: {}", e)))?;
    context
        .eval(Source::from_bytes(PRELUDE))
        .map_err(|e| SandboxError::internal(format!("Prelude failed: {}", e)))?;
    context
        .eval(Source::from_bytes(&lockdown_script(config)))
        .map_err(|e| SandboxError::internal(format!("Lockdown failed: {}", e)))?;

    let script = Script::parse(Source::from_bytes(source), None, &mut context)
        .map_err(|e| SandboxError::ParseError { message: e.to_string() })?;

    script
        .evaluate(&mut context)
        .map_err(|e| runtime_error(guest, e))?;
    context
        .eval(Source::from_bytes(MAIN_INVOCATION))
        .map_err(|e| runtime_error(guest, e))?;
    Ok(())
}

/// Remove every global not on the allow-list and optionally freeze prototypes.
fn lockdown_script(config: &InterpreterSandboxConfig) -> String {
    let allowed_list = config
        .allowed_globals
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(",");
    let freeze = if config.freeze_prototypes {
        "Object.freeze(Object.prototype); Object.freeze(Array.prototype); \
         if (typeof __Function !== 'undefined') { Object.freeze(__Function.prototype); }"
    } else {
        ""
    };
    format!(
        r#"
(function () {{
    var __allowed = new Set([{allowed_list}]);
    var __global = (typeof globalThis !== 'undefined') ? globalThis : this;
    var __Function = __global.Function;
    Object.getOwnPropertyNames(__global).forEach(function (key) {{
        if (!__allowed.has(key)) {{
            try {{ delete __global[key]; }} catch (e) {{ __global[key] = undefined; }}
        }}
    }});
    {freeze}
}})();
"#
    )
}

/// An uncaught exception that came out of `dispatch` keeps its capability
/// classification; anything else is a plain runtime fault.
fn runtime_error(guest: &GuestContext, err: JsError) -> SandboxError {
    let message = err.to_string();
    if let Some(cap_err) = guest.last_error() {
        if message.contains(&cap_err.to_string()) {
            return cap_err.into();
        }
    }
    SandboxError::RuntimeError { message }
}

#[async_trait::async_trait]
impl CodeSandbox for InterpreterSandbox {
    fn sandbox_type(&self) -> SandboxType {
        SandboxType::Interpreter
    }

    fn supported_languages(&self) -> Vec<CodeLanguage> {
        vec![CodeLanguage::JavaScript]
    }

    fn cancellation(&self) -> CancellationGuarantee {
        CancellationGuarantee::BestEffort
    }

    async fn execute(
        &self,
        request: SandboxRequest,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> ExecutionResult {
        let result = self.execute_inner(request, dispatcher).await;
        self.stats.write().await.record(&result);
        result
    }

    async fn validate(&self, source: &str) -> Result<(), SandboxError> {
        self.check_size(source)?;
        let mut context = Context::default();
        Script::parse(Source::from_bytes(source), None, &mut context)
            .map(|_| ())
            .map_err(|e| SandboxError::ParseError { message: e.to_string() })
    }

    async fn health_check(&self) -> HealthStatus {
        let request = SandboxRequest::new(
            "print('ok');",
            CodeLanguage::JavaScript,
            Duration::from_secs(5),
        );
        let refuse_all: Arc<dyn Dispatcher> =
            Arc::new(|name: &str, _args: serde_json::Value| -> Result<serde_json::Value, CapabilityError> {
                Err(CapabilityError::NotFound { name: name.to_string() })
            });
        let result = self.execute_inner(request, refuse_all).await;
        match (result.success, result.stdout.trim()) {
            (true, "ok") => HealthStatus::Healthy,
            (true, _) => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    async fn get_stats(&self) -> SandboxStats {
        self.stats.read().await.clone()
    }
}

// ================================
// Tests
// ================================
