use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use xcapsule_types::*;

#[cfg(feature = "builtin-sandbox-js")]
use super::InterpreterSandboxConfig;
#[cfg(feature = "builtin-sandbox-wasm")]
use super::WasmSandboxConfig;

/// Execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Embedded JavaScript interpreter
    Interpreter,
    /// Isolated WebAssembly module
    Wasm,
}

impl Backend {
    pub fn language(&self) -> CodeLanguage {
        match self {
            Backend::Interpreter => CodeLanguage::JavaScript,
            Backend::Wasm => CodeLanguage::Wasm,
        }
    }

    pub fn for_language(language: CodeLanguage) -> Self {
        match language {
            CodeLanguage::JavaScript => Backend::Interpreter,
            CodeLanguage::Wasm => Backend::Wasm,
        }
    }

    /// Guess from untagged source: a WAT module is unambiguous, anything else
    /// goes to the interpreter.
    pub fn sniff(source: &str) -> Self {
        if source.trim_start().starts_with("(module") {
            Backend::Wasm
        } else {
            Backend::Interpreter
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "js" | "javascript" | "interpreter" => Ok(Backend::Interpreter),
            "wasm" | "wat" => Ok(Backend::Wasm),
            other => Err(format!("unknown backend '{}', expected js or wasm", other)),
        }
    }
}

/// Sandbox manager configuration
#[derive(Clone, Debug, Default)]
pub struct SandboxManagerConfig {
    /// Interpreter backend configuration
    #[cfg(feature = "builtin-sandbox-js")]
    pub interpreter: InterpreterSandboxConfig,
    /// WASM backend configuration
    #[cfg(feature = "builtin-sandbox-wasm")]
    pub wasm: WasmSandboxConfig,
}

/// Sandbox manager - holds one implementation per backend
pub struct SandboxManager {
    /// Backend used when a response carries no usable language tag
    default_backend: Backend,

    sandboxes: HashMap<Backend, Arc<dyn CodeSandbox>>,
}

impl SandboxManager {
    /// Create a manager with every built-in backend enabled by features
    pub fn new(config: SandboxManagerConfig) -> Result<Self, SandboxError> {
        let mut manager = Self::new_empty(Backend::Interpreter);

        #[cfg(feature = "builtin-sandbox-js")]
        {
            let sandbox = Arc::new(super::InterpreterSandbox::new(config.interpreter.clone()))
                as Arc<dyn CodeSandbox>;
            manager.register_sandbox(Backend::Interpreter, sandbox);
        }

        #[cfg(feature = "builtin-sandbox-wasm")]
        {
            let sandbox =
                Arc::new(super::WasmSandbox::new(config.wasm.clone())?) as Arc<dyn CodeSandbox>;
            manager.register_sandbox(Backend::Wasm, sandbox);
        }

        let _ = &config;
        Ok(manager)
    }

    /// Create an empty sandbox manager
    pub fn new_empty(default_backend: Backend) -> Self {
        Self {
            default_backend,
            sandboxes: HashMap::new(),
        }
    }

    pub fn with_default_backend(mut self, backend: Backend) -> Self {
        self.default_backend = backend;
        self
    }

    /// Register a sandbox implementation
    pub fn register_sandbox(&mut self, backend: Backend, sandbox: Arc<dyn CodeSandbox>) {
        self.sandboxes.insert(backend, sandbox);
    }

    pub fn get(&self, backend: Backend) -> Option<Arc<dyn CodeSandbox>> {
        self.sandboxes.get(&backend).cloned()
    }

    pub fn default_backend(&self) -> Backend {
        self.default_backend
    }

    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.sandboxes.keys().copied().collect();
        backends.sort_by_key(|b| *b as u8);
        backends
    }

    /// Pick a backend from a fenced-block language tag.
    pub fn select(&self, language_tag: Option<&str>) -> Backend {
        language_tag
            .and_then(CodeLanguage::from_tag)
            .map(Backend::for_language)
            .unwrap_or(self.default_backend)
    }

    /// Execute on the backend that handles `request.language`
    pub async fn execute(
        &self,
        request: SandboxRequest,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> ExecutionResult {
        let backend = Backend::for_language(request.language);
        match self.sandboxes.get(&backend) {
            Some(sandbox) => sandbox.execute(request, dispatcher).await,
            None => ExecutionResult::rejected(SandboxError::UnsupportedLanguage {
                language: request.language,
            }),
        }
    }

    /// Parse or compile without running
    pub async fn validate(&self, source: &str, language: CodeLanguage) -> Result<(), SandboxError> {
        let sandbox = self
            .sandboxes
            .get(&Backend::for_language(language))
            .ok_or(SandboxError::UnsupportedLanguage { language })?;
        sandbox.validate(source).await
    }

    /// Perform health check for all sandboxes
    pub async fn health_check_all(&self) -> Vec<(SandboxType, HealthStatus)> {
        let mut results = Vec::new();
        for backend in self.backends() {
            if let Some(sandbox) = self.sandboxes.get(&backend) {
                results.push((sandbox.sandbox_type(), sandbox.health_check().await));
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn refuse_all() -> Arc<dyn Dispatcher> {
        Arc::new(|name: &str, _: serde_json::Value| -> Result<serde_json::Value, CapabilityError> {
            Err(CapabilityError::NotFound { name: name.into() })
        })
    }

    #[test]
    fn test_backend_from_str_and_sniff() {
        assert_eq!("js".parse::<Backend>().unwrap(), Backend::Interpreter);
        assert_eq!("WASM".parse::<Backend>().unwrap(), Backend::Wasm);
        assert!("python".parse::<Backend>().is_err());
        assert_eq!(Backend::sniff("  (module (func))"), Backend::Wasm);
        assert_eq!(Backend::sniff("print(1)"), Backend::Interpreter);
    }

    #[test]
    fn test_select_by_tag() {
        let manager = SandboxManager::new_empty(Backend::Interpreter);
        assert_eq!(manager.select(Some("wat")), Backend::Wasm);
        assert_eq!(manager.select(Some("wasm")), Backend::Wasm);
        assert_eq!(manager.select(Some("javascript")), Backend::Interpreter);
        assert_eq!(manager.select(Some("python")), Backend::Interpreter);
        assert_eq!(manager.select(None), Backend::Interpreter);

        let manager = manager.with_default_backend(Backend::Wasm);
        assert_eq!(manager.select(None), Backend::Wasm);
    }

    #[tokio::test]
    async fn test_empty_manager_rejects() {
        let manager = SandboxManager::new_empty(Backend::Interpreter);
        let result = manager
            .execute(
                SandboxRequest::new("print(1)", CodeLanguage::JavaScript, Duration::from_secs(1)),
                refuse_all(),
            )
            .await;
        assert_eq!(
            result.error,
            Some(SandboxError::UnsupportedLanguage { language: CodeLanguage::JavaScript })
        );
        assert!(manager.health_check_all().await.is_empty());
    }

    #[cfg(all(feature = "builtin-sandbox-js", feature = "builtin-sandbox-wasm"))]
    #[tokio::test]
    async fn test_sandbox_manager_creation() {
        let manager = SandboxManager::new(SandboxManagerConfig::default()).unwrap();
        assert_eq!(manager.backends(), vec![Backend::Interpreter, Backend::Wasm]);
        let health = manager.health_check_all().await;
        assert_eq!(health.len(), 2);
        for (_st, status) in &health {
            assert_eq!(*status, HealthStatus::Healthy);
        }
        assert_eq!(
            manager.get(Backend::Wasm).unwrap().cancellation(),
            CancellationGuarantee::Structural
        );
    }

    #[cfg(feature = "builtin-sandbox-js")]
    #[tokio::test]
    async fn test_sandbox_manager_execute_js() {
        let manager = SandboxManager::new(SandboxManagerConfig::default()).unwrap();
        let request = SandboxRequest::new(
            "print(6 * 7);",
            CodeLanguage::JavaScript,
            Duration::from_secs(5),
        );
        let result = manager.execute(request, refuse_all()).await;
        assert!(result.success);
        assert_eq!(result.stdout, "42\n");
    }

    #[cfg(feature = "builtin-sandbox-js")]
    #[tokio::test]
    async fn test_sandbox_manager_validate() {
        let manager = SandboxManager::new(SandboxManagerConfig::default()).unwrap();
        assert!(manager
            .validate("function main() {}", CodeLanguage::JavaScript)
            .await
            .is_ok());
        assert!(manager
            .validate("function main( {", CodeLanguage::JavaScript)
            .await
            .is_err());
    }
}
