//! Name-indexed table of host capabilities.
//!
//! Generated code only knows capabilities by name, so this is the one place
//! in the crate that dispatches dynamically on strings. Every name is checked
//! against the closed table at call time.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RegistryError;
use xcapsule_types::CapabilityError;

/// Host-side implementation of one capability.
///
/// Called synchronously on the guest's worker thread. Implementations that
/// wrap a singleton resource must serialize access themselves, typically via
/// [`super::SharedResource`].
pub trait CapabilityHandler: Send + Sync {
    fn call(&self, args: &Map<String, Value>) -> anyhow::Result<Value>;
}

impl<F> CapabilityHandler for F
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync,
{
    fn call(&self, args: &Map<String, Value>) -> anyhow::Result<Value> {
        self(args)
    }
}

/// Declared parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
}

impl ParameterSpec {
    pub fn required(name: &str, param_type: ParamType) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: ParamType) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: false,
        }
    }
}

/// A registered capability.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub implementation: Arc<dyn CapabilityHandler>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterSpec>,
        implementation: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            implementation,
        }
    }

    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    fn check_args(&self, args: &Map<String, Value>) -> Result<(), CapabilityError> {
        for param in &self.parameters {
            match args.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(CapabilityError::InvalidArguments {
                        name: self.name.clone(),
                        message: format!("missing required parameter '{}'", param.name),
                    });
                }
                Some(value) if !value.is_null() && !param.param_type.accepts(value) => {
                    return Err(CapabilityError::InvalidArguments {
                        name: self.name.clone(),
                        message: format!(
                            "parameter '{}' must be {}",
                            param.name,
                            param.param_type.as_str()
                        ),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Introspection view of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

/// Capability registry. Shared by `Arc` between sessions; adds no locking
/// around implementations.
#[derive(Default)]
pub struct CapabilityRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        validate_definition(&definition)?;
        if self.tools.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateCapability {
                name: definition.name,
            });
        }
        self.tools.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn register_fn<F>(
        &mut self,
        name: &str,
        description: &str,
        parameters: Vec<ParameterSpec>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(ToolDefinition::new(
            name,
            description,
            parameters,
            Arc::new(handler),
        ))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invoke a capability. The implementation's own error is passed through
    /// as [`CapabilityError::Failed`].
    pub fn call(&self, name: &str, args: &Map<String, Value>) -> Result<Value, CapabilityError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| CapabilityError::NotFound {
                name: name.to_string(),
            })?;
        tool.check_args(args)?;
        tool.implementation
            .call(args)
            .map_err(|e| CapabilityError::Failed {
                name: name.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// All capabilities, sorted by name.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self.tools.values().map(ToolDefinition::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Plain-text catalogue, one capability per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for info in self.list() {
            let params = info
                .parameters
                .iter()
                .map(|p| {
                    format!(
                        "{}{}: {}",
                        p.name,
                        if p.required { "" } else { "?" },
                        p.param_type.as_str()
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "{}({}) - {}", info.name, params, info.description);
        }
        out
    }
}

fn validate_definition(definition: &ToolDefinition) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidDefinition {
        name: definition.name.clone(),
        reason,
    };
    if definition.name.is_empty() {
        return Err(invalid("name is empty".into()));
    }
    if !definition
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid("name may only contain [A-Za-z0-9_.-]".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for param in &definition.parameters {
        if !seen.insert(param.name.as_str()) {
            return Err(invalid(format!("parameter '{}' declared twice", param.name)));
        }
    }
    Ok(())
}
