//! End-to-end tests for the execution engine.
//!
//! These spawn the real `scriptbox` binary as the worker process.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use scriptbox::api::{handle_request, STATUS_BAD_REQUEST, STATUS_OK, STATUS_UNAVAILABLE};
use scriptbox::config::{AdmissionPolicy, EngineConfig, LimitsConfig, WorkerConfig};
use scriptbox::error::RequestError;
use scriptbox::result::NO_OUTPUT_MARKER;
use scriptbox::sandbox::engine::{ExecutionEngine, ExecutionRequest};
use scriptbox::sandbox::outcome::ErrorClass;
use scriptbox::sandbox::realm::UNSERIALIZABLE;

fn config(slots: usize, admission: AdmissionPolicy) -> EngineConfig {
    EngineConfig::new(
        LimitsConfig {
            memory_limit_bytes: None,
            ..LimitsConfig::default()
        },
        WorkerConfig {
            max_concurrent: slots,
            admission,
            program: Some(PathBuf::from(env!("CARGO_BIN_EXE_scriptbox"))),
        },
    )
}

fn engine() -> ExecutionEngine {
    ExecutionEngine::new(config(4, AdmissionPolicy::Queue)).unwrap()
}

async fn run(engine: &ExecutionEngine, source: &str) -> scriptbox::result::ExecutionResult {
    engine.execute(ExecutionRequest::new(source)).await.unwrap()
}

#[tokio::test]
async fn test_no_output_marker() {
    let result = run(&engine(), "var x = 1;").await;
    assert_eq!(result.output, NO_OUTPUT_MARKER);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_console_lines_in_order() {
    let result = run(&engine(), "console.log(1); console.log(2);").await;
    assert_eq!(result.output, "1\n2");
}

#[tokio::test]
async fn test_severity_prefixes_and_return_value() {
    let result = run(
        &engine(),
        "console.warn('careful'); console.info('note'); 40 + 2",
    )
    .await;
    assert_eq!(result.output, "WARNING: careful\nINFO: note\nReturn value: 42");
}

#[tokio::test]
async fn test_thrown_error_keeps_output() {
    let result = run(&engine(), "console.log('before'); throw new Error('x');").await;
    assert_eq!(result.output, "before");
    assert_eq!(result.error.as_deref(), Some("Error: x"));
    assert_eq!(result.error_class, Some(ErrorClass::Runtime));
}

#[tokio::test]
async fn test_syntax_error() {
    let result = run(&engine(), "function (").await;
    assert!(result.error.is_some());
    assert_eq!(result.error_class, Some(ErrorClass::Compile));
}

#[tokio::test]
async fn test_host_capabilities_are_unreachable() {
    let engine = engine();
    for source in ["process.env", "require('fs')", "fetch('http://example.com')"] {
        let result = run(&engine, source).await;
        assert_eq!(result.error_class, Some(ErrorClass::Runtime), "source: {}", source);
        assert!(
            result.error.as_deref().unwrap_or_default().starts_with("ReferenceError"),
            "source: {}, error: {:?}",
            source,
            result.error
        );
    }
}

#[tokio::test]
async fn test_timers_and_promises_run_before_result() {
    let result = run(
        &engine(),
        "setTimeout(() => console.log('later'), 20);\n\
         Promise.resolve(1).then(v => console.log('promise', v));\n\
         console.log('now');",
    )
    .await;
    assert_eq!(result.output, "now\npromise 1\nlater");
}

#[tokio::test]
async fn test_infinite_loop_times_out_and_engine_recovers() {
    let engine = engine();
    let deadline = Duration::from_millis(300);

    let started = Instant::now();
    let result = engine
        .execute(ExecutionRequest::new("while (true) {}").with_deadline(deadline))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.error.as_deref(), Some("Code execution timeout (300 ms)"));
    assert_eq!(result.error_class, Some(ErrorClass::Timeout));
    assert!(elapsed >= deadline);
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);

    let next = run(&engine, "console.log('still alive')").await;
    assert_eq!(next.output, "still alive");
    assert_eq!(engine.available_slots(), 4);
}

#[tokio::test]
async fn test_pending_interval_hits_deadline() {
    let engine = engine();
    let result = engine
        .execute(
            ExecutionRequest::new("setInterval(() => console.log('tick'), 10);")
                .with_deadline(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(result.error_class, Some(ErrorClass::Timeout));
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let engine = engine();
    let source = "var shared = (typeof shared === 'undefined') ? 'mine' : 'leaked';\n\
                  globalThis.marker = (globalThis.marker || 0) + 1;\n\
                  shared + ' ' + marker";

    let (a, b, c) = tokio::join!(run(&engine, source), run(&engine, source), run(&engine, source));
    for result in [a, b, c] {
        assert_eq!(result.output, "Return value: mine 1");
    }
}

#[tokio::test]
async fn test_queue_admission_waits_for_slot() {
    let engine = ExecutionEngine::new(config(1, AdmissionPolicy::Queue)).unwrap();
    let (a, b) = tokio::join!(run(&engine, "1"), run(&engine, "2"));
    assert_eq!(a.output, "Return value: 1");
    assert_eq!(b.output, "Return value: 2");
}

#[tokio::test]
async fn test_reject_admission_when_saturated() {
    let engine = ExecutionEngine::new(config(1, AdmissionPolicy::Reject)).unwrap();

    let slow = engine.execute(
        ExecutionRequest::new("while (true) {}").with_deadline(Duration::from_millis(1000)),
    );
    let rejected = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.execute(ExecutionRequest::new("1")).await
    };

    let (slow, rejected) = tokio::join!(slow, rejected);
    assert_eq!(slow.unwrap().error_class, Some(ErrorClass::Timeout));
    assert_eq!(rejected.unwrap_err(), RequestError::Saturated { limit: 1 });
}

#[tokio::test]
async fn test_output_cap_truncates() {
    let mut config = config(1, AdmissionPolicy::Queue);
    config.limits.max_output_bytes = 64;
    let engine = ExecutionEngine::new(config).unwrap();

    let result = run(&engine, "for (var i = 0; i < 1000; i++) console.log('line ' + i);").await;
    assert!(result.error.is_none());
    assert!(result.output.starts_with("line 0\nline 1"));
    assert!(result
        .output
        .ends_with("... output truncated (limit of 64 bytes reached)"));
}

#[tokio::test]
async fn test_api_round_trip() {
    let engine = engine();

    let ok = handle_request(&engine, br#"{"code": "console.log('hi')"}"#).await;
    assert_eq!(ok.status, STATUS_OK);
    assert_eq!(ok.body_json(), r#"{"output":"hi"}"#);

    let failed = handle_request(&engine, br#"{"code": "throw new TypeError('bad')"}"#).await;
    assert_eq!(failed.status, STATUS_OK);
    assert_eq!(failed.body_json(), r#"{"error":"TypeError: bad"}"#);

    let invalid = handle_request(&engine, br#"{"source": "1"}"#).await;
    assert_eq!(invalid.status, STATUS_BAD_REQUEST);
}

#[tokio::test]
async fn test_api_maps_saturation_to_503() {
    let engine = ExecutionEngine::new(config(1, AdmissionPolicy::Reject)).unwrap();

    let slow = handle_request(&engine, br#"{"code": "while (true) {}", "timeout_ms": 1000}"#);
    let rejected = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle_request(&engine, br#"{"code": "1"}"#).await
    };

    let (_, rejected) = tokio::join!(slow, rejected);
    assert_eq!(rejected.status, STATUS_UNAVAILABLE);
}

#[tokio::test]
async fn test_deeply_nested_array_logs_placeholder() {
    let result = run(
        &engine(),
        "var a = [];\n\
         for (var i = 0; i < 20000; i++) a = [a];\n\
         console.log('before');\n\
         console.log(a);",
    )
    .await;
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.output, format!("before\n{}", UNSERIALIZABLE));
}

#[tokio::test]
async fn test_throwing_deeply_nested_object() {
    let result = run(
        &engine(),
        "var o = {};\n\
         for (var i = 0; i < 20000; i++) o = { a: o };\n\
         throw o;",
    )
    .await;
    assert_eq!(result.error.as_deref(), Some(UNSERIALIZABLE));
    assert_eq!(result.error_class, Some(ErrorClass::Runtime));
}

#[tokio::test]
async fn test_deeply_nested_source_is_compile_error() {
    let engine = engine();
    for source in ["[".repeat(60_000), format!("{}1{}", "(".repeat(30_000), ")".repeat(30_000))] {
        let result = run(&engine, &source).await;
        assert_eq!(result.error_class, Some(ErrorClass::Compile));
        assert!(result.error.unwrap().starts_with("SyntaxError"));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_memory_exhaustion_is_runtime_error() {
    let mut config = config(1, AdmissionPolicy::Queue);
    config.limits.memory_limit_bytes = Some(256 * 1024 * 1024);
    let engine = ExecutionEngine::new(config).unwrap();

    let result = engine
        .execute(
            ExecutionRequest::new("var s = 'x'; while (true) s += s;")
                .with_deadline(Duration::from_secs(10)),
        )
        .await
        .unwrap();
    assert_eq!(result.error_class, Some(ErrorClass::Runtime), "error: {:?}", result.error);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_unhandled_rejections_are_runtime_errors() {
    let engine = engine();
    for source in [
        "(async () => { throw new Error('x'); })();",
        "Promise.reject(new Error('x'));",
    ] {
        let result = run(&engine, source).await;
        assert_eq!(result.error.as_deref(), Some("Error: x"), "source: {}", source);
        assert_eq!(result.error_class, Some(ErrorClass::Runtime));
    }
}

#[tokio::test]
async fn test_caught_rejection_is_not_an_error() {
    let result = run(
        &engine(),
        "Promise.reject(new Error('x')).catch(e => console.log('caught', e.message));",
    )
    .await;
    assert!(result.error.is_none());
    assert_eq!(result.output, "caught x");
}
