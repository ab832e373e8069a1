//! Config parser: converts raw YAML/JSON/TOML text into [`XcapsuleConfig`].

use std::path::Path;

use super::XcapsuleConfig;
use crate::error::ConfigError;

/// Supported config formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format (`.yaml` / `.yml`).
    Yaml,
    /// JSON format (`.json`).
    Json,
    /// TOML format (`.toml`).
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Parse config content
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<XcapsuleConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(XcapsuleConfig::default());
    }
    match format {
        ConfigFormat::Yaml => {
            serde_saphyr::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        ConfigFormat::Toml => {
            // Go through serde_json::Value so TOML and the other formats
            // deserialize through the same path.
            let toml_val: toml::Value =
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            serde_json::from_value(toml_value_to_json(toml_val))
                .map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

/// Read and parse a config file, picking the format from its extension.
pub fn load_config(path: impl AsRef<Path>) -> Result<XcapsuleConfig, ConfigError> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content, format)?;
    tracing::debug!(path = %path.display(), ?format, "loaded config");
    Ok(config)
}

/// Convert a [`toml::Value`] into a [`serde_json::Value`].
///
/// TOML has no null, and datetimes are stringified.
fn toml_value_to_json(val: toml::Value) -> serde_json::Value {
    match val {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_value_to_json).collect())
        }
        toml::Value::Table(tbl) => serde_json::Value::Object(
            tbl.into_iter()
                .map(|(k, v)| (k, toml_value_to_json(v)))
                .collect(),
        ),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TrustLevel;
    use crate::sandbox::Backend;
    use crate::validation::DenyCategory;

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
validator:
  max_source_bytes: 1024
  disabled_categories: [dynamic_code]
pipeline:
  default_timeout_ms: 250
  default_backend: wasm
  default_trust: untrusted
"#;
        let config = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.validator.max_source_bytes, 1024);
        assert_eq!(config.validator.disabled_categories, vec![DenyCategory::DynamicCode]);
        assert_eq!(config.pipeline.default_timeout_ms, 250);
        assert_eq!(config.pipeline.default_backend, Backend::Wasm);
        assert_eq!(config.pipeline.default_trust, TrustLevel::Untrusted);
        assert!(config.pipeline.require_structural_cancellation_for_untrusted);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"pipeline":{"step_budget":5000},"validator":{"extra_rules":[
            {"category":"network_socket","pattern":"\\bsendBeacon\\b","description":"beacon"}]}}"#;
        let config = parse_config(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.pipeline.step_budget, Some(5000));
        assert_eq!(config.validator.extra_rules.len(), 1);
        assert_eq!(config.validator.max_source_bytes, 64 * 1024);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[pipeline]
default_timeout_ms = 1500
require_structural_cancellation_for_untrusted = false

[validator]
max_source_bytes = 2048
"#;
        let config = parse_config(toml_str, ConfigFormat::Toml).unwrap();
        assert_eq!(config.pipeline.default_timeout_ms, 1500);
        assert!(!config.pipeline.require_structural_cancellation_for_untrusted);
        assert_eq!(config.validator.max_source_bytes, 2048);
    }

    #[cfg(feature = "builtin-sandbox-wasm")]
    #[test]
    fn test_parse_backend_sections() {
        let yaml = "wasm:\n  max_fuel: 42\n  enable_fuel: true\n";
        let config = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.wasm.max_fuel, 42);
        assert_eq!(config.sandbox_config().wasm.max_fuel, 42);
    }

    #[test]
    fn test_empty_is_default() {
        let config = parse_config("  \n", ConfigFormat::Yaml).unwrap();
        assert_eq!(config.pipeline.default_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_config("{{{invalid", ConfigFormat::Json).is_err());
        assert!(parse_config("[[[bad", ConfigFormat::Toml).is_err());
        assert!(parse_config("pipeline: [unclosed", ConfigFormat::Yaml).is_err());
    }

    #[test]
    fn test_round_trip_through_formats() {
        let mut config = XcapsuleConfig::default();
        config.pipeline.default_timeout_ms = 777;
        config.validator.max_source_bytes = 99;

        let json = serde_json::to_string(&config).unwrap();
        let back = parse_config(&json, ConfigFormat::Json).unwrap();
        assert_eq!(back.pipeline.default_timeout_ms, 777);

        let toml_text = toml::to_string(&config).unwrap();
        let back = parse_config(&toml_text, ConfigFormat::Toml).unwrap();
        assert_eq!(back.validator.max_source_bytes, 99);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xcapsule.yaml");
        std::fs::write(&path, "pipeline:\n  default_timeout_ms: 321\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.pipeline.default_timeout_ms, 321);

        let bad = dir.path().join("xcapsule.ini");
        std::fs::write(&bad, "").unwrap();
        assert!(matches!(load_config(&bad), Err(ConfigError::UnsupportedFormat(_))));
        assert!(matches!(
            load_config(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
