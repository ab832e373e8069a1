use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Map, Value};

use xcapsule::{
    load_config, Backend, CapabilityRegistry, ParamType, ParameterSpec, Pipeline, RunOptions,
    SharedResource, TrustLevel, XcapsuleConfig,
};

/// Run a model response against the demo capability registry.
#[derive(Parser, Debug)]
#[command(name = "xcapsule", version, about, long_about = None)]
struct Cli {
    /// Response file, or `-` for stdin
    input: String,

    /// Execution backend (js or wasm); guessed from the fence tag when omitted
    #[arg(long, value_parser = Backend::from_str)]
    backend: Option<Backend>,

    /// Wall-clock budget in milliseconds
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Treat the source as untrusted
    #[arg(long)]
    untrusted: bool,

    /// Config file (yaml, json or toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn read_response(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read response from stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read '{}'", input))
    }
}

/// Demo capabilities: `echo`, `add` and a key-value store behind one shared handle.
fn demo_registry(
    store: SharedResource<HashMap<String, Value>>,
) -> anyhow::Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();

    registry.register_fn(
        "echo",
        "Return the arguments unchanged",
        vec![],
        |args: &Map<String, Value>| Ok(Value::Object(args.clone())),
    )?;

    registry.register_fn(
        "add",
        "Add two numbers",
        vec![
            ParameterSpec::required("a", ParamType::Number),
            ParameterSpec::required("b", ParamType::Number),
        ],
        |args: &Map<String, Value>| {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or_default();
            let b = args.get("b").and_then(Value::as_f64).unwrap_or_default();
            Ok(json!(a + b))
        },
    )?;

    let kv = store.clone();
    registry.register_fn(
        "kv_get",
        "Read a value from the key-value store",
        vec![ParameterSpec::required("key", ParamType::String)],
        move |args: &Map<String, Value>| {
            let key = args.get("key").and_then(Value::as_str).unwrap_or_default();
            let value = kv.with(|map| map.get(key).cloned())?;
            Ok(value.unwrap_or(Value::Null))
        },
    )?;

    let kv = store;
    registry.register_fn(
        "kv_set",
        "Write a value to the key-value store and return the previous one",
        vec![
            ParameterSpec::required("key", ParamType::String),
            ParameterSpec::required("value", ParamType::Any),
        ],
        move |args: &Map<String, Value>| {
            let key = args.get("key").and_then(Value::as_str).unwrap_or_default();
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            let previous = kv.with(|map| map.insert(key.to_string(), value))?;
            Ok(previous.unwrap_or(Value::Null))
        },
    )?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => XcapsuleConfig::default(),
    };
    let response = read_response(&cli.input)?;

    let store = SharedResource::open("kv", HashMap::new());
    let registry = demo_registry(store.clone())?;
    tracing::info!(capabilities = registry.len(), "demo registry ready");

    let pipeline = Pipeline::builder(Arc::new(registry))
        .config(config)
        .exclusive_resource(Arc::new(store))
        .build()?;

    let options = RunOptions {
        backend: cli.backend,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        step_budget: None,
        trust: cli.untrusted.then_some(TrustLevel::Untrusted),
    };
    let report = pipeline.run_with(&response, options).await;

    print!("{}", report.result.stdout);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}
