//! Value translation and variable references end to end.

mod support;

use serde_json::{json, Value};
use support::{attach, loc, pause_and_top_frame, DapClient};
use vela_dap::config::DapConfig;
use vela_vdwp::{
    mock::MockVm, FrameInfo, LineTableEntry, NamedValue, ObjectSummary, RefTag, TypeInfo,
    VwpValue,
};

fn named(name: &str, declared: Option<&str>, value: VwpValue) -> NamedValue {
    NamedValue {
        name: name.to_string(),
        declared_type: declared.map(str::to_string),
        value,
    }
}

async fn vm_with_locals() -> MockVm {
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
    vm.set_locals(
        1,
        100,
        vec![
            named("x", Some("Int"), VwpValue::Int(42)),
            named("ratio", Some("Float"), VwpValue::Float(2.0)),
            named("greeting", Some("Str"), VwpValue::Str("hi".to_string())),
            named("ok", Some("Bool"), VwpValue::Bool(true)),
            named("raw", Some("Byte"), VwpValue::Byte(7)),
            named("nothing", None, VwpValue::Nil),
            named(
                "p",
                Some("Point"),
                VwpValue::Ref {
                    id: 0x50,
                    tag: RefTag::Record,
                    type_desc: 9,
                },
            ),
            named(
                "gone",
                None,
                VwpValue::Ref {
                    id: 0x51,
                    tag: RefTag::Record,
                    type_desc: 9,
                },
            ),
        ],
    );
    vm.set_object(
        0x50,
        ObjectSummary {
            type_desc: 9,
            type_name: "Point".to_string(),
            tag: RefTag::Record,
            size: 2,
            brief: None,
        },
        vec![
            named("a", None, VwpValue::Int(1)),
            named("b", None, VwpValue::Str("s".to_string())),
        ],
    );
    vm.set_type_info(
        9,
        TypeInfo {
            name: "Point".to_string(),
            fields: vec![
                ("a".to_string(), "Int".to_string()),
                ("b".to_string(), "Str".to_string()),
            ],
        },
    );
    vm.set_unreadable_object(0x51);
    vm
}

async fn locals_reference(client: &mut DapClient, frame_id: i64) -> i64 {
    let body = client
        .request_ok("scopes", json!({ "frameId": frame_id }))
        .await;
    assert_eq!(body["scopes"][0]["name"], "Locals");
    body["scopes"][0]["variablesReference"]
        .as_i64()
        .expect("locals reference")
}

fn variable<'a>(variables: &'a Value, name: &str) -> &'a Value {
    variables["variables"]
        .as_array()
        .expect("variables array")
        .iter()
        .find(|entry| entry["name"] == name)
        .unwrap_or_else(|| panic!("no variable named {name}"))
}

#[tokio::test]
async fn primitives_render_canonically() {
    let vm = vm_with_locals().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let locals = locals_reference(&mut client, frame_id).await;
    let body = client
        .request_ok("variables", json!({ "variablesReference": locals }))
        .await;

    let x = variable(&body, "x");
    assert_eq!(x["value"], "42");
    assert_eq!(x["kind"], "primitive");
    assert_eq!(x["type"], "Int");
    assert_eq!(x["variablesReference"], 0);

    assert_eq!(variable(&body, "ratio")["value"], "2.0");
    assert_eq!(variable(&body, "greeting")["value"], "hi");
    assert_eq!(variable(&body, "ok")["value"], "true");
    assert_eq!(variable(&body, "raw")["value"], "7");

    let nothing = variable(&body, "nothing");
    assert_eq!(nothing["value"], "()");
    assert_eq!(nothing["kind"], "unknown");
}

#[tokio::test]
async fn record_children_are_lazy_and_typed() {
    let vm = vm_with_locals().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let locals = locals_reference(&mut client, frame_id).await;
    let body = client
        .request_ok("variables", json!({ "variablesReference": locals }))
        .await;

    let p = variable(&body, "p");
    assert_eq!(p["value"], "Point (2 fields)");
    assert_eq!(p["kind"], "structured");
    assert_eq!(p["type"], "Point");
    let p_ref = p["variablesReference"].as_i64().expect("record reference");
    assert!(p_ref > 0);

    let children = client
        .request_ok("variables", json!({ "variablesReference": p_ref }))
        .await;
    let a = variable(&children, "a");
    assert_eq!(a["value"], "1");
    // The VM sent no declared type for the field; the type bridge fills it
    // from the record's declaration.
    assert_eq!(a["type"], "Int");
    let b = variable(&children, "b");
    assert_eq!(b["value"], "s");
    assert_eq!(b["type"], "Str");

    // Within one suspension the reference is stable: re-listing the locals
    // hands back the same reference for p, and fetching it again yields the
    // same children.
    let body_again = client
        .request_ok("variables", json!({ "variablesReference": locals }))
        .await;
    assert_eq!(
        variable(&body_again, "p")["variablesReference"],
        json!(p_ref)
    );
    let children_again = client
        .request_ok("variables", json!({ "variablesReference": p_ref }))
        .await;
    assert_eq!(children["variables"], children_again["variables"]);
}

#[tokio::test]
async fn unreadable_values_degrade_to_a_sentinel() {
    let vm = vm_with_locals().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let locals = locals_reference(&mut client, frame_id).await;
    let body = client
        .request_ok("variables", json!({ "variablesReference": locals }))
        .await;

    let gone = variable(&body, "gone");
    assert_eq!(gone["value"], "<unreadable>");
    assert_eq!(gone["kind"], "unknown");
    assert_eq!(gone["variablesReference"], 0);
}

#[tokio::test]
async fn references_go_stale_across_a_resume() {
    let vm = vm_with_locals().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let locals = locals_reference(&mut client, frame_id).await;
    client
        .request_ok("variables", json!({ "variablesReference": locals }))
        .await;

    // Resuming invalidates every reference issued during the suspension.
    client.request_ok("continue", json!({ "threadId": 1 })).await;
    let message = client
        .request_err("variables", json!({ "variablesReference": locals }))
        .await;
    assert!(
        message.starts_with("STALE_REFERENCE"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn unknown_references_are_distinguished_from_stale_ones() {
    let vm = vm_with_locals().await;
    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    pause_and_top_frame(&mut client, 1).await;
    let message = client
        .request_err("variables", json!({ "variablesReference": 999_999 }))
        .await;
    assert!(
        message.starts_with("UNKNOWN_REFERENCE"),
        "unexpected error: {message}"
    );
}

#[tokio::test]
async fn error_values_surface_their_message() {
    let vm = vm_with_locals().await;
    vm.set_object(
        0x60,
        ObjectSummary {
            type_desc: 11,
            type_name: "FileError".to_string(),
            tag: RefTag::Error,
            size: 2,
            brief: Some("file not found".to_string()),
        },
        vec![
            named("message", Some("Str"), VwpValue::Str("file not found".to_string())),
            named("cause", None, VwpValue::Nil),
        ],
    );
    vm.set_locals(
        1,
        100,
        vec![named(
            "err",
            None,
            VwpValue::Ref {
                id: 0x60,
                tag: RefTag::Error,
                type_desc: 11,
            },
        )],
    );

    let mut client = DapClient::start(DapConfig::default());
    attach(&mut client, &vm).await;

    let frame_id = pause_and_top_frame(&mut client, 1).await;
    let locals = locals_reference(&mut client, frame_id).await;
    let body = client
        .request_ok("variables", json!({ "variablesReference": locals }))
        .await;

    let err = variable(&body, "err");
    assert_eq!(err["value"], "FileError: file not found");
    assert_eq!(err["kind"], "error");
    let err_ref = err["variablesReference"].as_i64().expect("error reference");

    let children = client
        .request_ok("variables", json!({ "variablesReference": err_ref }))
        .await;
    assert_eq!(variable(&children, "message")["value"], "file not found");
    // A nil cause is omitted entirely.
    assert!(children["variables"]
        .as_array()
        .expect("variables array")
        .iter()
        .all(|entry| entry["name"] != "cause"));
}
