//! Isolated WebAssembly backend using wasmtime.
//!
//! Guest modules are compiled once per distinct source on the blocking pool
//! and instantiated per execution into a fresh store with no WASI linked. The only imports a module may declare are the `env` functions in
//! [`crate::host_functions`]; the only way out of the store is `dispatch`.
//!
//! Cancellation is structural. Every store runs with an epoch deadline whose
//! callback checks the execution's cancel flag, so when the caller's deadline
//! passes it sets the flag, bumps the engine epoch and the guest traps at its
//! next loop back-edge or function entry. Fuel metering bounds total work
//! independently of wall-clock time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use wasmtime::{Engine, ExternType, Linker, Module, Store, StoreLimitsBuilder, Trap, UpdateDeadline};

use xcapsule_types::*;

use crate::host_functions::{register_host_functions, GuestState, HOST_IMPORTS, HOST_MODULE};

/// Entry points tried in order
const ENTRY_POINTS: &[&str] = &["main", "_start"];

/// Compiled modules kept before the cache is flushed
const MODULE_CACHE_CAPACITY: usize = 32;

type CompiledModule = (Module, &'static str);

/// WASM sandbox configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmSandboxConfig {
    /// Max wasm binary size (bytes)
    pub max_wasm_size: usize,
    /// Max linear memory pages (64KB per page)
    pub max_memory_pages: u32,
    /// Default fuel budget when the request carries no step budget
    pub max_fuel: u64,
    /// Enable fuel metering
    pub enable_fuel: bool,
    /// Max captured stdout (bytes)
    pub max_stdout_bytes: usize,
    /// Max native stack for wasm frames (bytes)
    pub max_wasm_stack: usize,
}

impl Default for WasmSandboxConfig {
    fn default() -> Self {
        Self {
            max_wasm_size: 5 * 1024 * 1024,
            max_memory_pages: 256,
            max_fuel: 1_000_000_000,
            enable_fuel: true,
            max_stdout_bytes: 1024 * 1024,
            max_wasm_stack: 4 * 1024 * 1024,
        }
    }
}

/// What the worker thread reports back.
struct WorkerOutcome {
    result: Result<(), SandboxError>,
    steps_used: Option<u64>,
}

/// WASM sandbox implementation
pub struct WasmSandbox {
    engine: Engine,
    config: WasmSandboxConfig,
    stats: Arc<RwLock<SandboxStats>>,
    /// Source text -> compiled module, shared by validate and execute
    modules: Mutex<HashMap<String, CompiledModule>>,
}

impl WasmSandbox {
    pub fn new(config: WasmSandboxConfig) -> Result<Self, SandboxError> {
        let engine = build_engine(&config)?;
        Ok(Self {
            engine,
            config,
            stats: Arc::new(RwLock::new(SandboxStats::default())),
            modules: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WasmSandboxConfig {
        &self.config
    }

    /// Compile on the blocking pool, reusing an earlier compilation of the
    /// same source. Only successful compilations are cached.
    async fn compile(&self, source: &str) -> Result<CompiledModule, SandboxError> {
        if let Some(compiled) = self.modules.lock().get(source) {
            return Ok(compiled.clone());
        }

        let engine = self.engine.clone();
        let config = self.config.clone();
        let owned = source.to_string();
        let compiled = tokio::task::spawn_blocking(move || compile_module(&engine, &config, &owned))
            .await
            .map_err(|e| SandboxError::internal(format!("compile task failed: {}", e)))??;

        let mut modules = self.modules.lock();
        if modules.len() >= MODULE_CACHE_CAPACITY {
            modules.clear();
        }
        modules.insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    async fn execute_inner(
        &self,
        request: SandboxRequest,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> ExecutionResult {
        let start_time = Instant::now();

        if request.language != CodeLanguage::Wasm {
            return ExecutionResult::rejected(SandboxError::UnsupportedLanguage {
                language: request.language,
            });
        }

        let (module, entry) = match self.compile(&request.source).await {
            Ok(compiled) => compiled,
            Err(e) => return ExecutionResult::rejected(e),
        };

        let guest = GuestContext::new(dispatcher, self.config.max_stdout_bytes);
        let (done_tx, done_rx) = oneshot::channel();

        let worker_guest = guest.clone();
        let engine = self.engine.clone();
        let config = self.config.clone();
        let timeout = request.timeout;
        let fuel_budget = request.step_budget.unwrap_or(config.max_fuel);
        let spawned = std::thread::Builder::new()
            .name("xcapsule-wasm".into())
            .spawn(move || {
                let outcome = run_guest(
                    &engine,
                    &config,
                    &module,
                    entry,
                    worker_guest,
                    fuel_budget,
                    timeout,
                );
                let _ = done_tx.send(outcome);
            });
        if let Err(e) = spawned {
            return ExecutionResult::failed(
                SandboxError::internal(format!("Failed to spawn worker: {}", e)),
                String::new(),
                start_time.elapsed(),
            );
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(WorkerOutcome { result: Ok(()), steps_used })) => {
                ExecutionResult::succeeded(guest.stdout(), start_time.elapsed()).with_steps(steps_used)
            }
            Ok(Ok(WorkerOutcome { result: Err(e), steps_used })) => {
                let result = if e.is_pre_execution() {
                    ExecutionResult::rejected(e)
                } else {
                    ExecutionResult::failed(e, guest.stdout(), start_time.elapsed())
                };
                result.with_steps(steps_used)
            }
            Ok(Err(_)) => ExecutionResult::failed(
                SandboxError::internal("worker exited without reporting a result"),
                guest.stdout(),
                start_time.elapsed(),
            ),
            Err(_) => {
                guest.cancel();
                self.engine.increment_epoch();
                tracing::debug!(
                    timeout_ms = timeout.as_millis() as u64,
                    "wasm deadline reached; guest interrupted"
                );
                ExecutionResult::failed(
                    SandboxError::timeout(timeout),
                    guest.stdout(),
                    start_time.elapsed(),
                )
            }
        }
    }
}

/// Instantiate and run a compiled guest module on the current thread. The
/// store, and with it every reference to `guest`, is dropped on return.
fn run_guest(
    engine: &Engine,
    config: &WasmSandboxConfig,
    module: &Module,
    entry: &str,
    guest: Arc<GuestContext>,
    fuel_budget: u64,
    timeout: Duration,
) -> WorkerOutcome {
    let mut linker = Linker::new(engine);
    if let Err(e) = register_host_functions(&mut linker) {
        return WorkerOutcome {
            result: Err(e),
            steps_used: None,
        };
    }

    let limits = StoreLimitsBuilder::new()
        .memory_size(config.max_memory_pages as usize * 64 * 1024)
        .instances(1)
        .build();
    let mut store = Store::new(engine, GuestState::new(guest.clone(), limits));
    store.limiter(|state| &mut state.limits);

    if config.enable_fuel {
        if let Err(e) = store.set_fuel(fuel_budget) {
            return WorkerOutcome {
                result: Err(SandboxError::internal(e)),
                steps_used: None,
            };
        }
    }
    // The deadline is armed before the flag is read: a cancel that lands
    // after the check bumps the epoch past this deadline and traps.
    store.set_epoch_deadline(1);
    let cancel = guest.clone();
    store.epoch_deadline_callback(move |_ctx| {
        if cancel.is_cancelled() {
            Err(Trap::Interrupt.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });

    let result = cancelled_before(&guest, timeout)
        .and_then(|()| {
            linker
                .instantiate(&mut store, module)
                .map_err(|e| classify_error(e, fuel_budget, timeout))
        })
        .and_then(|instance| {
            cancelled_before(&guest, timeout)?;
            instance
                .get_typed_func::<(), ()>(&mut store, entry)
                .and_then(|main| main.call(&mut store, ()))
                .map_err(|e| classify_error(e, fuel_budget, timeout))
        });
    drop(guest);

    let steps_used = if config.enable_fuel {
        store.get_fuel().ok().map(|left| fuel_budget.saturating_sub(left))
    } else {
        None
    };

    WorkerOutcome { result, steps_used }
}

fn cancelled_before(guest: &GuestContext, timeout: Duration) -> Result<(), SandboxError> {
    if guest.is_cancelled() {
        Err(SandboxError::timeout(timeout))
    } else {
        Ok(())
    }
}

/// Decode, compile and check a module's imports and entry point. Nothing in
/// the module runs here.
fn compile_module(
    engine: &Engine,
    config: &WasmSandboxConfig,
    source: &str,
) -> Result<(Module, &'static str), SandboxError> {
    let bytes = decode_wasm(source)?;
    validate_wasm_bytes(config, &bytes)?;

    let module = Module::new(engine, &bytes).map_err(|e| SandboxError::ParseError {
        message: format!("{:#}", e),
    })?;

    for import in module.imports() {
        if import.module() != HOST_MODULE || !HOST_IMPORTS.contains(&import.name()) {
            return Err(SandboxError::ValidationRejected {
                reason: format!(
                    "module imports unavailable host function {}::{}",
                    import.module(),
                    import.name()
                ),
            });
        }
    }

    let entry = ENTRY_POINTS
        .iter()
        .copied()
        .find(|name| match module.get_export(name) {
            Some(ExternType::Func(ty)) => ty.params().len() == 0 && ty.results().len() == 0,
            _ => false,
        })
        .ok_or_else(|| SandboxError::ValidationRejected {
            reason: "module exports neither `main` nor `_start` as a () -> () function".into(),
        })?;

    Ok((module, entry))
}

/// Accept base64-encoded binaries, falling back to WAT text.
fn decode_wasm(code: &str) -> Result<Vec<u8>, SandboxError> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::ParseError {
            message: "Empty wasm code".into(),
        });
    }

    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed.as_bytes()) {
        return Ok(bytes);
    }

    wat::parse_str(trimmed).map_err(|e| SandboxError::ParseError {
        message: e.to_string(),
    })
}

fn validate_wasm_bytes(config: &WasmSandboxConfig, bytes: &[u8]) -> Result<(), SandboxError> {
    if bytes.len() > config.max_wasm_size {
        return Err(SandboxError::ValidationRejected {
            reason: format!(
                "module is {} bytes, limit is {} bytes",
                bytes.len(),
                config.max_wasm_size
            ),
        });
    }
    if bytes.len() < 4 || !bytes.starts_with(b"\0asm") {
        return Err(SandboxError::ParseError {
            message: "Invalid WASM magic header".into(),
        });
    }
    Ok(())
}

fn classify_error(err: anyhow::Error, fuel_budget: u64, timeout: Duration) -> SandboxError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => SandboxError::StepLimitExceeded { budget: fuel_budget },
        Some(Trap::Interrupt) => SandboxError::timeout(timeout),
        Some(trap) => SandboxError::RuntimeError {
            message: format!("wasm trap: {}", trap),
        },
        None => SandboxError::RuntimeError {
            message: format!("{:#}", err),
        },
    }
}

fn build_engine(config: &WasmSandboxConfig) -> Result<Engine, SandboxError> {
    let mut cfg = wasmtime::Config::new();
    cfg.consume_fuel(config.enable_fuel);
    cfg.epoch_interruption(true);
    cfg.max_wasm_stack(config.max_wasm_stack);
    cfg.wasm_bulk_memory(true);
    cfg.wasm_multi_value(true);

    Engine::new(&cfg).map_err(SandboxError::internal)
}

#[async_trait::async_trait]
impl CodeSandbox for WasmSandbox {
    fn sandbox_type(&self) -> SandboxType {
        SandboxType::Wasm
    }

    fn supported_languages(&self) -> Vec<CodeLanguage> {
        vec![CodeLanguage::Wasm]
    }

    fn cancellation(&self) -> CancellationGuarantee {
        CancellationGuarantee::Structural
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
        self.compile(source).await.map(|_| ())
    }

    async fn health_check(&self) -> HealthStatus {
        let wat = r#"(module
            (import "env" "print" (func $print (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "ok")
            (func (export "main")
                (call $print (i32.const 0) (i32.const 2))))"#;
        let request = SandboxRequest::new(wat, CodeLanguage::Wasm, Duration::from_secs(5));
        let refuse_all: Arc<dyn Dispatcher> =
            Arc::new(|name: &str, _args: serde_json::Value| -> Result<serde_json::Value, CapabilityError> {
                Err(CapabilityError::NotFound { name: name.to_string() })
            });
        let result = self.execute_inner(request, refuse_all).await;
        match (result.success, result.stdout.as_str()) {
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
