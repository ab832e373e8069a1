#![cfg(all(feature = "builtin-sandbox-js", feature = "builtin-sandbox-wasm"))]

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{js_response, spy_registry, wat_module, wat_response};
use xcapsule::{
    validate, AuditOutcome, Backend, Pipeline, RunOptions, SandboxError, SessionState,
    SharedResource, TrustLevel,
};

fn pipeline(registry: Arc<xcapsule::CapabilityRegistry>) -> Pipeline {
    Pipeline::builder(registry).build().unwrap()
}

#[tokio::test]
async fn test_echo_scenario_interpreter() {
    let (registry, spy) = spy_registry();
    let report = pipeline(registry)
        .run(&js_response(r#"dispatch("echo", {"msg": "hi"});"#))
        .await;

    assert!(report.success(), "{:?}", report.result.error);
    assert_eq!(report.state, SessionState::Succeeded);
    assert_eq!(report.audit.len(), 1);
    let entry = &report.audit[0];
    assert_eq!(entry.sequence, 1);
    assert_eq!(entry.tool_name, "echo");
    assert_eq!(entry.args, json!({"msg": "hi"}));
    assert_eq!(entry.outcome, AuditOutcome::Result(json!({"msg": "hi"})));
    assert_eq!(spy.count(), 1);
    assert!(report.program.validated);
}

#[tokio::test]
async fn test_echo_scenario_wasm() {
    let (registry, spy) = spy_registry();
    let source = wat_module(
        r#"(func (export "main")
            (drop (call $dispatch (i32.const 0) (i32.const 4) (i32.const 16) (i32.const 12))))"#,
    );
    let report = pipeline(registry).run(&wat_response(&source)).await;

    assert!(report.success(), "{:?}", report.result.error);
    assert_eq!(report.backend, Some(xcapsule::SandboxType::Wasm));
    assert_eq!(report.audit.len(), 1);
    assert_eq!(report.audit[0].sequence, 1);
    assert_eq!(report.audit[0].tool_name, "echo");
    assert_eq!(report.audit[0].args, json!({"msg": "hi"}));
    assert_eq!(report.audit[0].outcome, AuditOutcome::Result(json!({"msg": "hi"})));
    assert_eq!(spy.count(), 1);
}

#[tokio::test]
async fn test_denylisted_source_never_executes() {
    let source = r#"dispatch("echo", {}); eval("1 + 1");"#;
    let (ok, reason) = validate(source);
    assert!(!ok);
    assert!(!reason.is_empty());

    let (registry, spy) = spy_registry();
    let report = pipeline(registry).run(&js_response(source)).await;

    assert_eq!(report.state, SessionState::Rejected);
    assert!(!report.program.validated);
    assert!(report.audit.is_empty());
    assert_eq!(spy.count(), 0);
    assert!(matches!(
        report.result.error,
        Some(SandboxError::ValidationRejected { .. })
    ));
}

#[tokio::test]
async fn test_program_without_calls_has_empty_audit() {
    let (registry, _) = spy_registry();
    let report = pipeline(registry).run(&js_response("print(1 + 2);")).await;

    assert!(report.success());
    assert_eq!(report.result.stdout, "3\n");
    assert!(report.audit.is_empty());
}

#[tokio::test]
async fn test_calls_are_audited_in_order() {
    let (registry, _) = spy_registry();
    let report = pipeline(registry)
        .run(&js_response(
            r#"
            var total = 0;
            for (var i = 1; i <= 4; i++) {
                total = dispatch("add", { a: total, b: i });
            }
            print(total);
            "#,
        ))
        .await;

    assert!(report.success(), "{:?}", report.result.error);
    assert_eq!(report.result.stdout, "10\n");
    assert_eq!(report.audit.len(), 4);
    let sequences: Vec<u64> = report.audit.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    let b_args: Vec<Value> = report.audit.iter().map(|e| e.args["b"].clone()).collect();
    assert_eq!(b_args, vec![json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn test_distinct_capabilities_audited_by_name_in_call_order() {
    let (registry, spy) = spy_registry();
    let report = pipeline(registry)
        .run(&js_response(
            r#"
            dispatch("echo", { step: 1 });
            var sum = dispatch("add", { a: 2, b: 3 });
            dispatch("tick", {});
            print(sum);
            "#,
        ))
        .await;

    assert!(report.success(), "{:?}", report.result.error);
    assert_eq!(report.result.stdout, "5\n");
    let names: Vec<&str> = report.audit.iter().map(|e| e.tool_name.as_str()).collect();
    assert_eq!(names, vec!["echo", "add", "tick"]);
    let sequences: Vec<u64> = report.audit.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(report.audit[0].args, json!({"step": 1}));
    assert_eq!(report.audit[1].outcome, AuditOutcome::Result(json!(5.0)));
    assert_eq!(report.audit[2].outcome, AuditOutcome::Result(Value::Null));
    assert_eq!(spy.count(), 3);
}

#[tokio::test]
async fn test_timeout_keeps_prior_calls_interpreter() {
    let (registry, _) = spy_registry();
    let options = RunOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let report = pipeline(registry)
        .run_with(
            &js_response(r#"dispatch("echo", {n: 1}); for (;;) { dispatch("tick", {}); }"#),
            options,
        )
        .await;

    assert_eq!(report.state, SessionState::TimedOut);
    assert!(report.result.error.as_ref().unwrap().is_timeout());
    assert!(report.audit.len() >= 2);
    assert_eq!(report.audit[0].tool_name, "echo");
    assert_eq!(report.audit[0].outcome, AuditOutcome::Result(json!({"n": 1})));
}

#[tokio::test]
async fn test_timeout_keeps_prior_calls_wasm() {
    let (registry, _) = spy_registry();
    let source = wat_module(
        r#"(func (export "main")
            (drop (call $dispatch (i32.const 0) (i32.const 4) (i32.const 16) (i32.const 12)))
            (loop $l (br $l)))"#,
    );
    let options = RunOptions {
        timeout: Some(Duration::from_millis(150)),
        step_budget: Some(u64::MAX / 2),
        ..Default::default()
    };
    let report = pipeline(registry)
        .run_with(&wat_response(&source), options)
        .await;

    assert_eq!(report.state, SessionState::TimedOut);
    assert_eq!(report.audit.len(), 1);
    assert_eq!(report.audit[0].tool_name, "echo");
}

#[tokio::test]
async fn test_missing_capability_can_be_handled() {
    let (registry, _) = spy_registry();
    let report = pipeline(registry)
        .run(&js_response(
            r#"
            try { dispatch("delete_everything", {}); } catch (e) { print("refused"); }
            dispatch("echo", { ok: true });
            "#,
        ))
        .await;

    assert!(report.success(), "{:?}", report.result.error);
    assert_eq!(report.result.stdout, "refused\n");
    assert_eq!(report.audit.len(), 2);
    assert!(report.audit[0].is_error());
    assert_eq!(report.audit[0].tool_name, "delete_everything");
    assert_eq!(report.audit[1].sequence, 2);
}

#[tokio::test]
async fn test_uncaught_capability_error_fails_session() {
    let (registry, _) = spy_registry();
    let report = pipeline(registry)
        .run(&js_response(r#"dispatch("add", { a: 1 });"#))
        .await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.audit.len(), 1);
    assert!(report.audit[0].is_error());
}

#[tokio::test]
async fn test_untrusted_interpreter_source_is_refused() {
    let (registry, spy) = spy_registry();
    let options = RunOptions {
        trust: Some(TrustLevel::Untrusted),
        ..Default::default()
    };
    let report = pipeline(registry)
        .run_with(&js_response(r#"dispatch("echo", {});"#), options)
        .await;

    assert_eq!(report.state, SessionState::Rejected);
    assert!(matches!(
        report.result.error,
        Some(SandboxError::PolicyRejected { .. })
    ));
    assert!(report.audit.is_empty());
    assert_eq!(spy.count(), 0);
}

#[tokio::test]
async fn test_untrusted_wasm_source_runs() {
    let (registry, _) = spy_registry();
    let source = wat_module(
        r#"(func (export "main")
            (drop (call $dispatch (i32.const 0) (i32.const 4) (i32.const 16) (i32.const 12))))"#,
    );
    let options = RunOptions {
        trust: Some(TrustLevel::Untrusted),
        ..Default::default()
    };
    let report = pipeline(registry)
        .run_with(&wat_response(&source), options)
        .await;
    assert!(report.success(), "{:?}", report.result.error);
}

#[tokio::test]
async fn test_empty_response_is_rejected() {
    let (registry, _) = spy_registry();
    let report = pipeline(registry).run("```js\n\n```").await;

    assert_eq!(report.state, SessionState::Rejected);
    assert_eq!(report.result.error, Some(SandboxError::ExtractionEmpty));
}

#[tokio::test]
async fn test_syntax_error_is_rejected_before_running() {
    let (registry, spy) = spy_registry();
    let report = pipeline(registry)
        .run(&js_response(r#"dispatch("echo", {}); function ( {"#))
        .await;

    assert_eq!(report.state, SessionState::Rejected);
    assert!(matches!(report.result.error, Some(SandboxError::ParseError { .. })));
    assert_eq!(spy.count(), 0);
}

#[tokio::test]
async fn test_untagged_wat_routes_to_wasm() {
    let (registry, _) = spy_registry();
    let source = wat_module(r#"(func (export "main") (call $print (i32.const 0) (i32.const 4)))"#);
    let report = pipeline(registry).run(&source).await;

    assert!(report.success(), "{:?}", report.result.error);
    assert_eq!(report.backend, Some(xcapsule::SandboxType::Wasm));
    assert_eq!(report.result.stdout, "echo");
}

#[tokio::test]
async fn test_exclusive_resource_refuses_concurrent_session() {
    let (registry, _) = spy_registry();
    let store = SharedResource::open("kv", HashMap::<String, Value>::new());
    let pipeline = Pipeline::builder(registry)
        .exclusive_resource(Arc::new(store.clone()))
        .build()
        .unwrap();

    let slow = js_response(r#"for (var i = 0; i < 10; i++) { dispatch("tick", {}); }"#);
    let quick = js_response(r#"dispatch("echo", {});"#);

    let (first, second) = tokio::join!(pipeline.run(&slow), pipeline.run(&quick));

    assert!(first.success(), "{:?}", first.result.error);
    assert_eq!(first.audit.len(), 10);
    assert_eq!(second.state, SessionState::Rejected);
    assert!(matches!(
        second.result.error,
        Some(SandboxError::PolicyRejected { .. })
    ));
    assert!(second.audit.is_empty());

    assert!(!store.is_leased());
    let third = pipeline.run(&quick).await;
    assert!(third.success());
}

#[tokio::test]
async fn test_check_does_not_execute() {
    let (registry, spy) = spy_registry();
    let pipeline = pipeline(registry);

    let report = pipeline
        .check(&js_response(r#"dispatch("echo", {});"#), RunOptions::default())
        .await;
    assert!(report.ok());
    assert_eq!(report.backend, Backend::Interpreter);
    assert!(report.program.validated);

    let report = pipeline
        .check(&js_response("new Function('return 1')"), RunOptions::default())
        .await;
    assert!(!report.ok());
    assert!(!report.validation.ok);

    let report = pipeline
        .check(
            &js_response("print(1);"),
            RunOptions {
                trust: Some(TrustLevel::Untrusted),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(report.error, Some(SandboxError::PolicyRejected { .. })));

    assert_eq!(spy.count(), 0);
}

#[tokio::test]
async fn test_backend_override() {
    let (registry, _) = spy_registry();
    let options = RunOptions {
        backend: Some(Backend::Wasm),
        ..Default::default()
    };
    let report = pipeline(registry)
        .run_with(&js_response("print(1);"), options)
        .await;

    assert_eq!(report.state, SessionState::Rejected);
    assert!(matches!(report.result.error, Some(SandboxError::ParseError { .. })));
}

#[tokio::test]
async fn test_lease_outlives_timed_out_session_until_worker_stops() {
    let store = SharedResource::open("kv", HashMap::<String, Value>::new());
    let mut registry = xcapsule::CapabilityRegistry::new();
    let kv = store.clone();
    registry
        .register_fn("slow_write", "Write after a delay", vec![], move |_: &serde_json::Map<String, Value>| {
            std::thread::sleep(Duration::from_millis(600));
            kv.with(|map| map.insert("k".into(), json!(1)))?;
            Ok(Value::Null)
        })
        .unwrap();
    registry
        .register_fn("echo", "", vec![], |args: &serde_json::Map<String, Value>| {
            Ok(Value::Object(args.clone()))
        })
        .unwrap();
    let pipeline = Pipeline::builder(Arc::new(registry))
        .exclusive_resource(Arc::new(store.clone()))
        .build()
        .unwrap();

    let first = pipeline
        .run_with(
            &js_response(r#"dispatch("slow_write", {}); print("done");"#),
            RunOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(first.state, SessionState::TimedOut);
    assert_eq!(first.audit[0].outcome, AuditOutcome::Unfinished);

    // The worker is still inside slow_write, so the resource stays leased.
    assert!(store.is_leased());
    let second = pipeline.run(&js_response(r#"dispatch("echo", {});"#)).await;
    assert_eq!(second.state, SessionState::Rejected);
    assert!(matches!(
        second.result.error,
        Some(SandboxError::PolicyRejected { .. })
    ));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while store.is_leased() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!store.is_leased());
    assert_eq!(store.with(|map| map.get("k").cloned()).unwrap(), Some(json!(1)));

    let third = pipeline.run(&js_response(r#"dispatch("echo", {});"#)).await;
    assert!(third.success(), "{:?}", third.result.error);
}
