//! Lexical safety screening of extracted source.
//!
//! The validator runs before anything executes and is fail-closed: a rejected
//! program never reaches a sandbox. Checks run in a fixed order (empty source,
//! size ceiling, deny rules in rule order) so the same input always yields the
//! same verdict and reason.
//!
//! This is defense in depth only. A textual scan is trivially evaded by
//! encoding forbidden tokens; the sandbox's isolation is the actual boundary.

pub mod rules;

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use xcapsule_types::SandboxError;

pub use rules::{builtin_rules, DenyCategory, DenyRule};

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Reject sources larger than this (bytes)
    pub max_source_bytes: usize,
    /// Built-in categories to skip
    pub disabled_categories: Vec<DenyCategory>,
    /// Rules appended after the built-in ones
    pub extra_rules: Vec<DenyRule>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            disabled_categories: Vec::new(),
            extra_rules: Vec::new(),
        }
    }
}

/// A deny rule match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub category: DenyCategory,
    pub description: String,
    pub matched: String,
    /// 1-based
    pub line: usize,
}

/// Why a source was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    Empty,
    TooLarge { size: usize, max: usize },
    Denied(Violation),
}

/// Verdict for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub reason: String,
    pub rejection: Option<Rejection>,
}

impl ValidationOutcome {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: String::new(),
            rejection: None,
        }
    }

    fn reject(rejection: Rejection) -> Self {
        let reason = match &rejection {
            Rejection::Empty => "no source found in response".to_string(),
            Rejection::TooLarge { size, max } => {
                format!("source is {} bytes, limit is {} bytes", size, max)
            }
            Rejection::Denied(v) => format!(
                "{} not allowed: `{}` at line {} ({})",
                v.category, v.matched, v.line, v.description
            ),
        };
        Self {
            ok: false,
            reason,
            rejection: Some(rejection),
        }
    }

    pub fn violation(&self) -> Option<&Violation> {
        match &self.rejection {
            Some(Rejection::Denied(v)) => Some(v),
            _ => None,
        }
    }

    /// The sandbox error a rejection maps to.
    pub fn to_error(&self) -> Option<SandboxError> {
        match self.rejection {
            None => None,
            Some(Rejection::Empty) => Some(SandboxError::ExtractionEmpty),
            Some(_) => Some(SandboxError::ValidationRejected {
                reason: self.reason.clone(),
            }),
        }
    }
}

struct CompiledRule {
    category: DenyCategory,
    description: String,
    regex: Regex,
}

/// Compiled deny rules plus the size ceiling.
pub struct SafetyValidator {
    max_source_bytes: usize,
    rules: Vec<CompiledRule>,
}

impl SafetyValidator {
    pub fn new(config: ValidatorConfig) -> Result<Self, ConfigError> {
        let rules = builtin_rules()
            .into_iter()
            .filter(|r| !config.disabled_categories.contains(&r.category))
            .chain(config.extra_rules)
            .map(|rule| {
                let regex = Regex::new(&rule.pattern).map_err(|e| ConfigError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    message: e.to_string(),
                })?;
                Ok(CompiledRule {
                    category: rule.category,
                    description: rule.description,
                    regex,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            max_source_bytes: config.max_source_bytes,
            rules,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn validate(&self, source: &str) -> ValidationOutcome {
        if source.trim().is_empty() {
            return ValidationOutcome::reject(Rejection::Empty);
        }
        if source.len() > self.max_source_bytes {
            return ValidationOutcome::reject(Rejection::TooLarge {
                size: source.len(),
                max: self.max_source_bytes,
            });
        }
        for rule in &self.rules {
            if let Some(m) = rule.regex.find(source) {
                let line = source[..m.start()].matches('\n').count() + 1;
                return ValidationOutcome::reject(Rejection::Denied(Violation {
                    category: rule.category,
                    description: rule.description.clone(),
                    matched: m.as_str().to_string(),
                    line,
                }));
            }
        }
        ValidationOutcome::pass()
    }
}

/// Validate with the default configuration.
pub fn validate(source: &str) -> (bool, String) {
    static DEFAULT: OnceLock<Option<SafetyValidator>> = OnceLock::new();
    match DEFAULT.get_or_init(|| SafetyValidator::new(ValidatorConfig::default()).ok()) {
        Some(validator) => {
            let outcome = validator.validate(source);
            (outcome.ok, outcome.reason)
        }
        None => (false, "built-in deny rules failed to compile".to_string()),
    }
}
