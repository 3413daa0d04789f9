//! Breakpoint behavior end to end: conditions, hit counting, re-sent sets,
//! and function breakpoints.

mod support;

use std::time::Duration;

use serde_json::json;
use support::{attach, loc, pause_and_top_frame, DapClient};
use vela_dap::config::DapConfig;
use vela_vdwp::{
    mock::{DelayedReply, MockVm, MockVmConfig, ScriptEvent, ScriptTurn},
    EvalOutcome, FrameInfo, LineTableEntry, VwpValue,
};

async fn vm_with_main() -> MockVm {
    let vm = MockVm::spawn().await.expect("mock vm");
    vm.add_thread(1, "main");
    vm.set_function(7, "main", "main.vela");
    vm.set_line_table(
        7,
        vec![
            LineTableEntry {
                code_index: 0,
                line: 1,
            },
            LineTableEntry {
                code_index: 3,
                line: 3,
            },
        ],
    );
    vm.set_frames(
        1,
        vec![FrameInfo {
            frame_id: 100,
            location: loc(7, 3),
        }],
    );
    vm.set_locations_for_line("main.vela", 3, vec![loc(7, 3)]);
    vm
}

fn breakpoint_turn() -> ScriptTurn {
    ScriptTurn::emit(vec![ScriptEvent::BreakpointAt {
        thread: 1,
        location: loc(7, 3),
    }])
}

#[tokio::test]
async fn conditional_breakpoint_counts_every_hit_but_stops_selectively() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let body = client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "main.vela" },
                "breakpoints": [{ "line": 3, "condition": "x > 5" }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);
    let id = body["breakpoints"][0]["id"].clone();

    // The loop passes x = 3, 7, 10: the condition holds on hits 2 and 3.
    vm.set_eval_result("x > 5", EvalOutcome::Value(VwpValue::Bool(false)));
    vm.push_eval_result("x > 5", EvalOutcome::Value(VwpValue::Bool(true)));
    vm.push_eval_result("x > 5", EvalOutcome::Value(VwpValue::Bool(true)));
    for _ in 0..3 {
        vm.push_script_turn(breakpoint_turn());
    }

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    let first = client.next_event("stopped").await;
    assert_eq!(first["body"]["reason"], "breakpoint");
    assert_eq!(first["body"]["hitBreakpointIds"], json!([id]));
    assert_eq!(first["body"]["hitCount"], 2);

    client.request_ok("continue", json!({ "threadId": 1 })).await;
    let second = client.next_event("stopped").await;
    assert_eq!(second["body"]["hitCount"], 3);

    // The filtered first hit produced no stop.
    client
        .expect_no_event("stopped", Duration::from_millis(200))
        .await;
    assert_eq!(vm.eval_calls().len(), 3);
}

#[tokio::test]
async fn hit_counts_and_ids_survive_a_resent_breakpoint_set() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let set_args = json!({
        "source": { "path": "main.vela" },
        "breakpoints": [{ "line": 3 }],
    });
    let body = client.request_ok("setBreakpoints", set_args.clone()).await;
    let id = body["breakpoints"][0]["id"].clone();

    vm.push_script_turn(breakpoint_turn());
    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;
    let first = client.next_event("stopped").await;
    assert_eq!(first["body"]["hitCount"], 1);

    // Editors re-send the whole set on any edit; a breakpoint matched by
    // file+line keeps its identity and its count.
    let body = client.request_ok("setBreakpoints", set_args).await;
    assert_eq!(body["breakpoints"][0]["id"], id);

    vm.push_script_turn(breakpoint_turn());
    client.request_ok("continue", json!({ "threadId": 1 })).await;
    let second = client.next_event("stopped").await;
    assert_eq!(second["body"]["hitBreakpointIds"], json!([id]));
    assert_eq!(second["body"]["hitCount"], 2);
}

#[tokio::test]
async fn a_line_without_code_registers_unverified() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let body = client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "main.vela" },
                "breakpoints": [{ "line": 12 }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], false);
    assert!(vm.event_requests().is_empty());
}

#[tokio::test]
async fn failed_condition_evaluation_stops_and_reports() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "main.vela" },
                "breakpoints": [{ "line": 3, "condition": "x +" }],
            }),
        )
        .await;
    vm.set_eval_result(
        "x +",
        EvalOutcome::Error("parse error: expected operand".to_string()),
    );
    vm.push_script_turn(breakpoint_turn());

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    // Fail safe: the thread stops and the client is told why filtering was
    // lost.
    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    let output = client.next_event("output").await;
    let text = output["body"]["output"].as_str().unwrap_or_default();
    assert!(text.contains("x +"), "unexpected output: {text}");
    assert!(text.contains("parse error"), "unexpected output: {text}");
}

#[tokio::test]
async fn hit_condition_gates_stops_without_conditions() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "main.vela" },
                "breakpoints": [{ "line": 3, "hitCondition": "3" }],
            }),
        )
        .await;
    for _ in 0..3 {
        vm.push_script_turn(breakpoint_turn());
    }

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["hitCount"], 3);
    client
        .expect_no_event("stopped", Duration::from_millis(200))
        .await;
    // No condition expressions were ever evaluated.
    assert!(vm.eval_calls().is_empty());
}

#[tokio::test]
async fn stops_raised_by_a_condition_evaluation_are_dropped() {
    // The condition expression itself hits a breakpoint: the VM reports a
    // nested stop and never answers the evaluation.
    let vm = MockVm::spawn_with_config(MockVmConfig {
        delayed_replies: vec![DelayedReply {
            command_set: 5,
            command: 1,
            delay: Duration::from_millis(400),
        }],
    })
    .await
    .expect("mock vm");
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
    vm.set_locations_for_line("main.vela", 3, vec![loc(7, 3)]);

    let mut config = DapConfig::default();
    config.evaluation.timeout_ms = 100;
    let mut client = DapClient::start(config);
    attach(&mut client, &vm).await;

    client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "main.vela" },
                "breakpoints": [{ "line": 3, "condition": "flaky()" }],
            }),
        )
        .await;
    vm.set_eval_result("flaky()", EvalOutcome::Value(VwpValue::Bool(true)));
    vm.push_eval_turn("flaky()", breakpoint_turn());
    vm.push_script_turn(breakpoint_turn());

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    // The fail-safe stop for the stuck condition is the only stop; the
    // nested hit neither stops nor counts.
    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["hitCount"], 1);
    let output = client.next_event("output").await;
    let text = output["body"]["output"].as_str().unwrap_or_default();
    assert!(text.contains("flaky()"), "unexpected output: {text}");
    assert!(text.contains("timed out"), "unexpected output: {text}");

    client
        .expect_no_event("stopped", Duration::from_millis(300))
        .await;
    // The dropped nested stop did not resume the reported thread either.
    assert_eq!(vm.thread_resume_calls(), 1);
}

#[tokio::test]
async fn exception_conditions_gate_stops_like_other_breakpoints() {
    let vm = vm_with_main().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let body = client
        .request_ok(
            "setExceptionBreakpoints",
            json!({
                "filterOptions": [{ "filterId": "uncaught", "condition": "retries > 2" }],
            }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);
    let id = body["breakpoints"][0]["id"].clone();

    vm.set_eval_result("retries > 2", EvalOutcome::Value(VwpValue::Bool(false)));
    vm.push_eval_result("retries > 2", EvalOutcome::Value(VwpValue::Bool(true)));
    let raise = || {
        ScriptTurn::emit(vec![ScriptEvent::Exception {
            thread: 1,
            exception: VwpValue::Nil,
            type_name: "Timeout".to_string(),
            uncaught: true,
            location: loc(7, 3),
        }])
    };
    vm.push_script_turn(raise());
    vm.push_script_turn(raise());

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    // The first raise is filtered by the condition; the second stops and
    // carries the filter's breakpoint identity.
    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "exception");
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([id]));
    assert_eq!(stopped["body"]["hitCount"], 2);
    assert!(stopped["body"]["description"]
        .as_str()
        .unwrap_or_default()
        .contains("uncaught Timeout"));
    assert_eq!(vm.eval_calls().len(), 2);
}

#[tokio::test]
async fn filtered_hits_under_all_threads_leave_reported_stops_alone() {
    let vm = vm_with_main().await;
    vm.add_thread(2, "worker");
    vm.set_frames(
        2,
        vec![FrameInfo {
            frame_id: 300,
            location: loc(7, 3),
        }],
    );

    let mut config = DapConfig::default();
    config.stops.all_threads = true;
    let mut client = DapClient::start(config);
    attach(&mut client, &vm).await;

    client
        .request_ok(
            "setBreakpoints",
            json!({
                "source": { "path": "main.vela" },
                "breakpoints": [{ "line": 3, "hitCondition": "1" }],
            }),
        )
        .await;

    // Both threads reach the breakpoint in one suspension; only the first
    // hit satisfies the hit condition.
    vm.push_script_turn(ScriptTurn::emit(vec![
        ScriptEvent::BreakpointAt {
            thread: 1,
            location: loc(7, 3),
        },
        ScriptEvent::BreakpointAt {
            thread: 2,
            location: loc(7, 3),
        },
    ]));

    pause_and_top_frame(&mut client, 2).await;
    client.request_ok("continue", json!({ "threadId": 2 })).await;

    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["allThreadsStopped"], true);
    client
        .expect_no_event("stopped", Duration::from_millis(200))
        .await;

    // The filtered hit on the worker resumed only the worker: thread 1's
    // reported stop (and its handles) stay live.
    assert_eq!(vm.vm_resume_calls(), 1);
    assert_eq!(vm.thread_resume_calls(), 1);
    let body = client
        .request_ok("stackTrace", json!({ "threadId": 1 }))
        .await;
    assert_eq!(body["stackFrames"][0]["name"], "main");
}

#[tokio::test]
async fn function_breakpoints_stop_on_entry() {
    let vm = vm_with_main().await;
    vm.set_function(8, "helper", "main.vela");
    vm.set_line_table(
        8,
        vec![LineTableEntry {
            code_index: 0,
            line: 9,
        }],
    );
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let body = client
        .request_ok(
            "setFunctionBreakpoints",
            json!({ "breakpoints": [{ "name": "helper" }] }),
        )
        .await;
    assert_eq!(body["breakpoints"][0]["verified"], true);

    vm.push_script_turn(ScriptTurn {
        set_frames: vec![(
            1,
            vec![
                FrameInfo {
                    frame_id: 200,
                    location: loc(8, 0),
                },
                FrameInfo {
                    frame_id: 100,
                    location: loc(7, 3),
                },
            ],
        )],
        events: vec![ScriptEvent::FunctionEntry {
            thread: 1,
            name: "helper".to_string(),
            location: loc(8, 0),
        }],
    });

    pause_and_top_frame(&mut client, 1).await;
    client.request_ok("continue", json!({ "threadId": 1 })).await;

    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "function breakpoint");

    let body = client
        .request_ok("stackTrace", json!({ "threadId": 1 }))
        .await;
    assert_eq!(body["stackFrames"][0]["name"], "helper");
    assert_eq!(body["stackFrames"][0]["line"], 9);
    assert_eq!(body["totalFrames"], 2);
}
