//! Session lifecycle: start, evaluation, exceptions, and termination.

mod support;

use std::time::Duration;

use serde_json::json;
use support::{attach, loc, pause_and_top_frame, DapClient};
use vela_dap::config::DapConfig;
use vela_vdwp::{
    mock::{DelayedReply, MockVm, MockVmConfig, ScriptEvent},
    EvalOutcome, FrameInfo, LineTableEntry, ObjectSummary, RefTag, VwpValue,
};

async fn vm_with_main() -> MockVm {
    let vm = MockVm::spawn().await.expect("mock vm");
    vm.add_thread(1, "main");
    vm.set_function(7, "main", "main.vela");
    vm.set_line_table(
        7,
        vec![LineTableEntry {
            code_index: 3,
            line: 3,
        }],
    );
    vm.set_frames(
        1,
        vec![FrameInfo {
            frame_id: 100,
            location: loc(7, 3),
        }],
    );
    vm
}

#[tokio::test]
async fn initialize_advertises_breakpoint_capabilities() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());

    let body = client
        .request_ok("initialize", json!({ "linesStartAt1": true }))
        .await;
    assert_eq!(body["supportsConditionalBreakpoints"], true);
    assert_eq!(body["supportsHitConditionalBreakpoints"], true);
    assert_eq!(body["supportsFunctionBreakpoints"], true);
    let filters = body["exceptionBreakpointFilters"]
        .as_array()
        .expect("filters");
    assert_eq!(filters.len(), 2);
    assert_eq!(filters[0]["filter"], "all");
    assert_eq!(filters[1]["filter"], "uncaught");
    drop(vm);
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let mut client = DapClient::start(DapConfig::default());
    let message = client
        .request_err("attach", json!({ "host": "127.0.0.1", "port": 1 }))
        .await;
    assert!(
        message.starts_with("INVALID_REQUEST"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn launch_of_a_missing_program_fails_cleanly() {
    let mut client = DapClient::start(DapConfig::default());
    client
        .request_ok("initialize", json!({ "linesStartAt1": true }))
        .await;

    let message = client
        .request_err(
            "launch",
            json!({ "program": "/nonexistent/vela-vm-for-tests" }),
        )
        .await;
    assert!(
        message.starts_with("LAUNCH_FAILURE"),
        "unexpected error: {message}"
    );

    // A failed start kills the session: terminated goes out and nothing is
    // serviced afterwards.
    client.next_event("terminated").await;
    let message = client.request_err("threads", json!({})).await;
    assert!(
        message.starts_with("SESSION_TERMINATED"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn attach_failure_terminates_the_session() {
    let mut client = DapClient::start(DapConfig::default());
    client
        .request_ok("initialize", json!({ "linesStartAt1": true }))
        .await;

    let message = client
        .request_err("attach", json!({ "host": "127.0.0.1", "port": 1 }))
        .await;
    assert!(
        message.starts_with("ATTACH_FAILURE"),
        "unexpected error: {message}"
    );

    client.next_event("terminated").await;
    let message = client.request_err("threads", json!({})).await;
    assert!(
        message.starts_with("SESSION_TERMINATED"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn terminate_is_absorbing() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    client.request_ok("terminate", json!({})).await;
    client.next_event("terminated").await;

    let message = client.request_err("threads", json!({})).await;
    assert!(
        message.starts_with("SESSION_TERMINATED"),
        "unexpected error: {message}"
    );
    assert!(vm.dispose_calls() >= 1);
}

#[tokio::test]
async fn vm_exit_reports_exited_then_terminated() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    vm.push_script_events(vec![ScriptEvent::VmExit { code: 3 }]);
    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    let exited = client.next_event("exited").await;
    assert_eq!(exited["body"]["exitCode"], 3);
    client.next_event("terminated").await;

    let message = client.request_err("threads", json!({})).await;
    assert!(
        message.starts_with("SESSION_TERMINATED"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn threads_reports_names() {
    let vm = vm_with_main().await;
    vm.add_thread(2, "worker");
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let body = client.request_ok("threads", json!({})).await;
    let threads = body["threads"].as_array().expect("threads");
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0]["id"], 1);
    assert_eq!(threads[0]["name"], "main");
    assert_eq!(threads[1]["name"], "worker");
}

#[tokio::test]
async fn evaluate_translates_results_and_failures() {
    let vm = vm_with_main().await;
    vm.set_eval_result("count", EvalOutcome::Value(VwpValue::Int(3)));
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let body = client
        .request_ok(
            "evaluate",
            json!({ "expression": "count", "frameId": frame_id }),
        )
        .await;
    assert_eq!(body["result"], "3");
    assert_eq!(body["variablesReference"], 0);

    let message = client
        .request_err(
            "evaluate",
            json!({ "expression": "missing", "frameId": frame_id }),
        )
        .await;
    assert!(
        message.starts_with("EVAL_FAILED"),
        "unexpected error: {message}"
    );
    assert!(message.contains("missing"), "unexpected error: {message}");
}

#[tokio::test]
async fn evaluation_timeouts_are_scoped_to_the_request() {
    let vm = MockVm::spawn_with_config(MockVmConfig {
        delayed_replies: vec![DelayedReply {
            command_set: 5,
            command: 1,
            delay: Duration::from_millis(500),
        }],
    })
    .await
    .expect("mock vm");
    vm.add_thread(1, "main");
    vm.set_function(7, "main", "main.vela");
    vm.set_frames(
        1,
        vec![FrameInfo {
            frame_id: 100,
            location: loc(7, 3),
        }],
    );
    vm.set_eval_result("slow()", EvalOutcome::Value(VwpValue::Int(1)));

    let mut config = DapConfig::default();
    config.evaluation.timeout_ms = 100;
    let mut client = DapClient::start(config);
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let message = client
        .request_err(
            "evaluate",
            json!({ "expression": "slow()", "frameId": frame_id }),
        )
        .await;
    assert!(
        message.starts_with("EVAL_TIMEOUT"),
        "unexpected error: {message}"
    );

    // The session survives; the same frame still answers.
    let body = client
        .request_ok("stackTrace", json!({ "threadId": 1 }))
        .await;
    assert_eq!(body["totalFrames"], 1);
}

#[tokio::test]
async fn uncaught_errors_stop_with_a_description() {
    let vm = vm_with_main().await;
    vm.set_object(
        0x60,
        ObjectSummary {
            type_desc: 11,
            type_name: "DivideByZero".to_string(),
            tag: RefTag::Error,
            size: 1,
            brief: Some("divide by zero".to_string()),
        },
        Vec::new(),
    );
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let body = client
        .request_ok("setExceptionBreakpoints", json!({ "filters": ["uncaught"] }))
        .await;
    let filter_id = body["breakpoints"][0]["id"].as_i64().expect("filter id");
    assert_eq!(body["breakpoints"][0]["verified"], true);

    vm.push_script_events(vec![ScriptEvent::Exception {
        thread: 1,
        exception: VwpValue::Ref {
            id: 0x60,
            tag: RefTag::Error,
            type_desc: 11,
        },
        type_name: "DivideByZero".to_string(),
        uncaught: true,
        location: loc(7, 3),
    }]);

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "exception");
    // Exception filters live the same breakpoint lifecycle as the other
    // kinds: an id and a hit count come back with the stop.
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([filter_id]));
    assert_eq!(stopped["body"]["hitCount"], 1);
    let description = stopped["body"]["description"]
        .as_str()
        .unwrap_or_default();
    assert!(
        description.contains("uncaught DivideByZero"),
        "unexpected description: {description}"
    );
    assert!(
        description.contains("divide by zero"),
        "unexpected description: {description}"
    );
}
