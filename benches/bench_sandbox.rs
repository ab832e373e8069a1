use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{Map, Value};

use xcapsule::sandbox::{
    CodeLanguage, CodeSandbox, InterpreterSandbox, InterpreterSandboxConfig, SandboxRequest,
    WasmSandbox, WasmSandboxConfig,
};
use xcapsule::{CapabilityRegistry, Dispatcher, Pipeline};

const JS_DISPATCH: &str = r#"
for (var i = 0; i < 10; i++) { dispatch("echo", { i: i }); }
"#;

const WAT_DISPATCH: &str = r#"(module
    (import "env" "dispatch" (func $dispatch (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "echo")
    (data (i32.const 16) "{\"i\":1}")
    (func (export "main") (local $n i32)
        (loop $l
            (drop (call $dispatch (i32.const 0) (i32.const 4) (i32.const 16) (i32.const 7)))
            (local.set $n (i32.add (local.get $n) (i32.const 1)))
            (br_if $l (i32.lt_u (local.get $n) (i32.const 10))))))"#;

fn echo_dispatcher() -> Arc<dyn Dispatcher> {
    Arc::new(|_: &str, args: Value| -> Result<Value, xcapsule::CapabilityError> { Ok(args) })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn bench_backends(c: &mut Criterion) {
    let rt = runtime();

    let js = InterpreterSandbox::new(InterpreterSandboxConfig::default());
    c.bench_function("interpreter_10_dispatches", |b| {
        b.to_async(&rt).iter(|| async {
            let request =
                SandboxRequest::new(JS_DISPATCH, CodeLanguage::JavaScript, Duration::from_secs(5));
            black_box(js.execute(request, echo_dispatcher()).await)
        });
    });

    let wasm = WasmSandbox::new(WasmSandboxConfig::default()).expect("wasm engine");
    c.bench_function("wasm_10_dispatches", |b| {
        b.to_async(&rt).iter(|| async {
            let request = SandboxRequest::new(WAT_DISPATCH, CodeLanguage::Wasm, Duration::from_secs(5));
            black_box(wasm.execute(request, echo_dispatcher()).await)
        });
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let rt = runtime();
    let mut registry = CapabilityRegistry::new();
    registry
        .register_fn("echo", "Return the arguments unchanged", vec![], |args: &Map<String, Value>| {
            Ok(Value::Object(args.clone()))
        })
        .expect("register echo");
    let pipeline = Pipeline::builder(Arc::new(registry))
        .audit_sinks(vec![])
        .build()
        .expect("pipeline");
    let response = format!("```js\n{}\n```", JS_DISPATCH);

    c.bench_function("pipeline_js_end_to_end", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(pipeline.run(&response).await) });
    });
}

criterion_group!(benches, bench_backends, bench_pipeline);
criterion_main!(benches);
