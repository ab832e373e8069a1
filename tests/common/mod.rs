#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use xcapsule::{CapabilityRegistry, ParamType, ParameterSpec};

/// Counts every capability invocation that reaches an implementation.
#[derive(Clone, Default)]
pub struct Spy {
    calls: Arc<AtomicUsize>,
}

impl Spy {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// `echo`, `add` and `tick` (sleeps 10ms), all wired to one spy.
pub fn spy_registry() -> (Arc<CapabilityRegistry>, Spy) {
    let spy = Spy::default();
    let mut registry = CapabilityRegistry::new();

    let s = spy.clone();
    registry
        .register_fn("echo", "Return the arguments unchanged", vec![], move |args: &Map<String, Value>| {
            s.hit();
            Ok(Value::Object(args.clone()))
        })
        .unwrap();

    let s = spy.clone();
    registry
        .register_fn(
            "add",
            "Add two numbers",
            vec![
                ParameterSpec::required("a", ParamType::Number),
                ParameterSpec::required("b", ParamType::Number),
            ],
            move |args: &Map<String, Value>| {
                s.hit();
                let a = args["a"].as_f64().unwrap_or_default();
                let b = args["b"].as_f64().unwrap_or_default();
                Ok(json!(a + b))
            },
        )
        .unwrap();

    let s = spy.clone();
    registry
        .register_fn("tick", "Sleep briefly", vec![], move |_: &Map<String, Value>| {
            s.hit();
            std::thread::sleep(Duration::from_millis(10));
            Ok(Value::Null)
        })
        .unwrap();

    (Arc::new(registry), spy)
}

pub fn js_response(source: &str) -> String {
    format!("Here is the program:\n\n```javascript\n{}\n```\n", source)
}

pub fn wat_response(source: &str) -> String {
    format!("```wat\n{}\n```", source)
}

/// Host imports plus a data segment holding `echo` at 0 and `{"msg":"hi"}` at 16.
pub const WAT_PRELUDE: &str = r#"
    (import "env" "dispatch" (func $dispatch (param i32 i32 i32 i32) (result i32)))
    (import "env" "response_len" (func $response_len (result i32)))
    (import "env" "response_read" (func $response_read (param i32 i32) (result i32)))
    (import "env" "print" (func $print (param i32 i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "echo")
    (data (i32.const 16) "{\"msg\":\"hi\"}")
"#;

pub fn wat_module(body: &str) -> String {
    format!("(module {} {})", WAT_PRELUDE, body)
}
