//! DAP server: the request loop, the outgoing writer task, and the VM event
//! task.
//!
//! The server is generic over its transport so the binary can run it on
//! stdio and the tests on an in-memory duplex pipe. All outgoing traffic
//! (responses and events) funnels through one mpsc channel into a single
//! writer task, which owns the sequence counter's ordering: messages are
//! written in the order they were produced.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use vela_vdwp::StepDepth;

use crate::{
    breakpoints::{
        BreakpointView, ExceptionBreakpointSpec, FunctionBreakpointSpec, SourceBreakpointSpec,
    },
    dap::{make_event, make_response, DapError, DapReader, DapWriter, Request},
    error::{DebugError, DebugResult},
    session::{ClientInfo, DebugSession, LaunchOptions, SessionEvent, SessionState},
};

const DEFAULT_LAUNCH_PORT: u16 = 7699;

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Value>,
    seq: Arc<AtomicI64>,
}

impl Outbox {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send_response(&self, request: &Request, result: DebugResult<Option<Value>>) {
        let response = match result {
            Ok(body) => make_response(self.next_seq(), request, true, body, None),
            Err(err) => make_response(
                self.next_seq(),
                request,
                false,
                None,
                Some(err.client_message()),
            ),
        };
        if let Ok(value) = serde_json::to_value(&response) {
            let _ = self.tx.send(value);
        }
    }

    pub fn send_event(&self, name: &str, body: Option<Value>) {
        let event = make_event(self.next_seq(), name, body);
        if let Ok(value) = serde_json::to_value(&event) {
            let _ = self.tx.send(value);
        }
    }
}

/// Serve one DAP client over the given transport until it disconnects.
pub async fn run<R, W>(session: Arc<DebugSession>, input: R, output: W) -> Result<(), DapError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = DapReader::new(input);
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let outbox = Outbox {
        tx,
        seq: Arc::new(AtomicI64::new(1)),
    };

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(output);
        while let Some(value) = rx.recv().await {
            if let Err(err) = writer.write_value(&value).await {
                tracing::debug!(%err, "dap write failed, stopping writer");
                break;
            }
        }
    });

    while let Some(request) = reader.read_request().await? {
        tracing::debug!(command = %request.command, seq = request.seq, "dap request");
        let disconnect = request.command == "disconnect";
        dispatch(&session, &outbox, request).await;
        if disconnect {
            break;
        }
    }

    // Client went away (or asked to); make sure the VM side is released.
    let _ = session.disconnect(false).await;
    drop(outbox);
    let _ = writer_task.await;
    Ok(())
}

async fn dispatch(session: &Arc<DebugSession>, outbox: &Outbox, request: Request) {
    let result = match request.command.as_str() {
        "initialize" => handle_initialize(session, outbox, &request),
        "launch" => handle_launch(session, outbox, &request).await,
        "attach" => handle_attach(session, outbox, &request).await,
        "setBreakpoints" => handle_set_breakpoints(session, &request).await,
        "setFunctionBreakpoints" => handle_set_function_breakpoints(session, &request).await,
        "setExceptionBreakpoints" => handle_set_exception_breakpoints(session, &request).await,
        "configurationDone" => Ok(None),
        "threads" => handle_threads(session).await,
        "stackTrace" => handle_stack_trace(session, &request).await,
        "scopes" => handle_scopes(session, &request),
        "variables" => handle_variables(session, &request).await,
        "evaluate" => handle_evaluate(session, &request).await,
        "continue" => handle_continue(session, outbox, &request).await,
        "next" => handle_step(session, outbox, &request, StepDepth::Over).await,
        "stepIn" => handle_step(session, outbox, &request, StepDepth::Into).await,
        "stepOut" => handle_step(session, outbox, &request, StepDepth::Out).await,
        "pause" => handle_pause(session, outbox, &request).await,
        "disconnect" => {
            let terminate = arg_bool(&request.arguments, "terminateDebuggee").unwrap_or(false);
            session.disconnect(terminate).await.map(|()| None)
        }
        "terminate" => {
            let result = session.disconnect(true).await.map(|()| None);
            outbox.send_event("terminated", None);
            result
        }
        other => Err(DebugError::InvalidRequest(format!(
            "unsupported command {other:?}"
        ))),
    };
    outbox.send_response(&request, result);
}

fn handle_initialize(
    session: &Arc<DebugSession>,
    outbox: &Outbox,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let info = ClientInfo {
        client_name: arg_str(&request.arguments, "clientName"),
        lines_start_at_one: arg_bool(&request.arguments, "linesStartAt1").unwrap_or(true),
    };
    session.initialize(info)?;
    outbox.send_event("initialized", None);
    Ok(Some(json!({
        "supportsConfigurationDoneRequest": true,
        "supportsFunctionBreakpoints": true,
        "supportsConditionalBreakpoints": true,
        "supportsHitConditionalBreakpoints": true,
        "supportsTerminateRequest": true,
        "exceptionBreakpointFilters": [
            { "filter": "all", "label": "All Errors", "default": false },
            { "filter": "uncaught", "label": "Uncaught Errors", "default": true },
        ],
    })))
}

async fn handle_launch(
    session: &Arc<DebugSession>,
    outbox: &Outbox,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let program = arg_str(&request.arguments, "program")
        .ok_or_else(|| DebugError::InvalidRequest("launch needs a program".to_string()))?;
    let args = request.arguments["args"]
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let options = LaunchOptions {
        program,
        args,
        cwd: arg_str(&request.arguments, "cwd"),
        port: arg_u64(&request.arguments, "port")
            .map(|port| port as u16)
            .unwrap_or(DEFAULT_LAUNCH_PORT),
    };
    if let Err(err) = session.launch(options).await {
        // Session-fatal: the state machine is already Terminated.
        outbox.send_event("terminated", None);
        return Err(err);
    }
    spawn_event_task(session.clone(), outbox.clone());
    Ok(None)
}

async fn handle_attach(
    session: &Arc<DebugSession>,
    outbox: &Outbox,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let host = arg_str(&request.arguments, "host").unwrap_or_else(|| "127.0.0.1".to_string());
    let port = arg_u64(&request.arguments, "port")
        .ok_or_else(|| DebugError::InvalidRequest("attach needs a port".to_string()))?;
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|_| DebugError::InvalidRequest(format!("invalid address {host}:{port}")))?;
    if let Err(err) = session.attach(addr).await {
        outbox.send_event("terminated", None);
        return Err(err);
    }
    spawn_event_task(session.clone(), outbox.clone());
    Ok(None)
}

async fn handle_set_breakpoints(
    session: &Arc<DebugSession>,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let path = request.arguments["source"]["path"]
        .as_str()
        .ok_or_else(|| DebugError::InvalidRequest("setBreakpoints needs a source path".to_string()))?
        .to_string();
    let line_in = line_in_offset(session);
    let specs = request.arguments["breakpoints"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(SourceBreakpointSpec {
                        line: (entry["line"].as_i64()? + line_in).max(1) as u32,
                        condition: entry["condition"].as_str().map(str::to_string),
                        hit_condition: entry["hitCondition"].as_str().map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let views = session.set_source_breakpoints(&path, specs).await?;
    Ok(Some(json!({
        "breakpoints": views
            .iter()
            .map(|view| breakpoint_json(session, view))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_set_function_breakpoints(
    session: &Arc<DebugSession>,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let specs = request.arguments["breakpoints"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(FunctionBreakpointSpec {
                        name: entry["name"].as_str()?.to_string(),
                        condition: entry["condition"].as_str().map(str::to_string),
                        hit_condition: entry["hitCondition"].as_str().map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let views = session.set_function_breakpoints(specs).await?;
    Ok(Some(json!({
        "breakpoints": views
            .iter()
            .map(|view| breakpoint_json(session, view))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_set_exception_breakpoints(
    session: &Arc<DebugSession>,
    request: &Request,
) -> DebugResult<Option<Value>> {
    // `filterOptions` entries carry a condition and take precedence over the
    // bare `filters` list for the same filter id.
    let mut specs: Vec<ExceptionBreakpointSpec> = request.arguments["filterOptions"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(ExceptionBreakpointSpec {
                        filter: entry["filterId"].as_str()?.to_string(),
                        condition: entry["condition"].as_str().map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if let Some(filters) = request.arguments["filters"].as_array() {
        for filter in filters.iter().filter_map(Value::as_str) {
            if !specs.iter().any(|spec| spec.filter == filter) {
                specs.push(ExceptionBreakpointSpec {
                    filter: filter.to_string(),
                    condition: None,
                });
            }
        }
    }

    let views = session.set_exception_breakpoints(specs).await?;
    Ok(Some(json!({
        "breakpoints": views
            .iter()
            .map(|view| breakpoint_json(session, view))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_threads(session: &Arc<DebugSession>) -> DebugResult<Option<Value>> {
    let threads = session.threads().await?;
    Ok(Some(json!({
        "threads": threads
            .iter()
            .map(|(id, name)| json!({ "id": id, "name": name }))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_stack_trace(
    session: &Arc<DebugSession>,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let thread = require_thread_id(request)?;
    let frames = session.stack_trace(thread).await?;
    let line_offset = line_out_offset(session);
    Ok(Some(json!({
        "stackFrames": frames
            .iter()
            .map(|frame| frame.to_json(line_offset))
            .collect::<Vec<_>>(),
        "totalFrames": frames.len(),
    })))
}

fn handle_scopes(session: &Arc<DebugSession>, request: &Request) -> DebugResult<Option<Value>> {
    let frame_id = request.arguments["frameId"]
        .as_i64()
        .ok_or_else(|| DebugError::InvalidRequest("scopes needs a frameId".to_string()))?;
    let scopes = session.scopes(frame_id)?;
    Ok(Some(json!({
        "scopes": scopes
            .iter()
            .map(|scope| json!({
                "name": scope.name,
                "variablesReference": scope.variables_reference,
                "expensive": false,
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn handle_variables(
    session: &Arc<DebugSession>,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let reference = request.arguments["variablesReference"].as_i64().ok_or_else(|| {
        DebugError::InvalidRequest("variables needs a variablesReference".to_string())
    })?;
    let variables = session.variables(reference).await?;
    Ok(Some(json!({
        "variables": variables
            .iter()
            .map(|variable| variable.to_json())
            .collect::<Vec<_>>(),
    })))
}

async fn handle_evaluate(
    session: &Arc<DebugSession>,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let expression = arg_str(&request.arguments, "expression")
        .ok_or_else(|| DebugError::InvalidRequest("evaluate needs an expression".to_string()))?;
    let frame_id = request.arguments["frameId"]
        .as_i64()
        .ok_or_else(|| DebugError::InvalidRequest("evaluate needs a frameId".to_string()))?;
    let variable = session.evaluate(frame_id, &expression).await?;
    Ok(Some(json!({
        "result": variable.value,
        "type": variable.declared_type,
        "variablesReference": variable.variables_reference,
    })))
}

async fn handle_continue(
    session: &Arc<DebugSession>,
    outbox: &Outbox,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let thread = require_thread_id(request)?;
    let all_threads = session.continue_thread(thread).await?;
    outbox.send_event(
        "continued",
        Some(json!({ "threadId": thread, "allThreadsContinued": all_threads })),
    );
    Ok(Some(json!({ "allThreadsContinued": all_threads })))
}

async fn handle_step(
    session: &Arc<DebugSession>,
    outbox: &Outbox,
    request: &Request,
    depth: StepDepth,
) -> DebugResult<Option<Value>> {
    let thread = require_thread_id(request)?;
    session.step(thread, depth).await?;
    outbox.send_event(
        "continued",
        Some(json!({ "threadId": thread, "allThreadsContinued": false })),
    );
    Ok(None)
}

async fn handle_pause(
    session: &Arc<DebugSession>,
    outbox: &Outbox,
    request: &Request,
) -> DebugResult<Option<Value>> {
    let thread = require_thread_id(request)?;
    session.pause(thread).await?;
    outbox.send_event(
        "stopped",
        Some(json!({
            "reason": "pause",
            "threadId": thread,
            "allThreadsStopped": false,
        })),
    );
    Ok(None)
}

fn require_thread_id(request: &Request) -> DebugResult<u64> {
    request.arguments["threadId"]
        .as_u64()
        .ok_or_else(|| DebugError::InvalidRequest("request needs a threadId".to_string()))
}

fn breakpoint_json(session: &Arc<DebugSession>, view: &BreakpointView) -> Value {
    let line_offset = line_out_offset(session);
    json!({
        "id": view.id,
        "verified": view.verified,
        "line": view.line.map(|line| i64::from(line) + line_offset),
    })
}

/// Offset applied to incoming client lines to get 1-based runtime lines.
fn line_in_offset(session: &Arc<DebugSession>) -> i64 {
    if session.client_lines_start_at_one() {
        0
    } else {
        1
    }
}

/// Offset applied to 1-based runtime lines before they go out to the client.
fn line_out_offset(session: &Arc<DebugSession>) -> i64 {
    if session.client_lines_start_at_one() {
        0
    } else {
        -1
    }
}

/// Forward VM events to the client until the connection dies.
///
/// One task per session: stop handling is serialized here, which is what
/// keeps per-thread event ordering intact.
pub fn spawn_event_task(session: Arc<DebugSession>, outbox: Outbox) {
    let Some(mut events) = session.subscribe_vm_events() else {
        return;
    };
    let Some(shutdown) = session.shutdown_token() else {
        return;
    };

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "vm event channel lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let mut terminated = false;
            for out in session.handle_vm_event(event).await {
                if out == SessionEvent::Terminated {
                    terminated = true;
                }
                send_session_event(&session, &outbox, out);
            }
            if terminated {
                return;
            }
        }

        // The wire dropped without a VmExit; tell the client the session is
        // over.
        if session.state() != SessionState::Terminated {
            let _ = session.disconnect(false).await;
            outbox.send_event("terminated", None);
        }
    });
}

fn send_session_event(session: &Arc<DebugSession>, outbox: &Outbox, event: SessionEvent) {
    match event {
        SessionEvent::Stopped {
            reason,
            thread,
            breakpoint_id,
            hit_count,
            description,
        } => {
            let mut body = json!({
                "reason": reason,
                "threadId": thread,
                "allThreadsStopped": session.stops_all_threads(),
            });
            if let Some(id) = breakpoint_id {
                body["hitBreakpointIds"] = json!([id]);
            }
            if let Some(count) = hit_count {
                body["hitCount"] = json!(count);
            }
            if let Some(text) = description {
                body["description"] = json!(text);
            }
            outbox.send_event("stopped", Some(body));
        }
        SessionEvent::Continued {
            thread,
            all_threads,
        } => outbox.send_event(
            "continued",
            Some(json!({ "threadId": thread, "allThreadsContinued": all_threads })),
        ),
        SessionEvent::Output { category, message } => outbox.send_event(
            "output",
            Some(json!({ "category": category, "output": format!("{message}\n") })),
        ),
        SessionEvent::Exited { code } => {
            outbox.send_event("exited", Some(json!({ "exitCode": code })))
        }
        SessionEvent::Terminated => outbox.send_event("terminated", None),
    }
}

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)?.as_str().map(str::to_string)
}

fn arg_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key)?.as_u64()
}

fn arg_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key)?.as_bool()
}
