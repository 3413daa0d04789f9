//! A small in-process Vela VM speaking VWP, used for unit and integration
//! testing.
//!
//! It supports just enough of the protocol to exercise `vela-vdwp` and
//! `vela-dap` without a real Vela toolchain installed. Tests configure the
//! world (threads, frames, variables, objects, metadata) through setters,
//! then script what the VM does on each resume.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{encode_command, encode_reply, VwpReader, VwpWriter, HANDSHAKE, HEADER_LEN},
    types::{
        EvalOutcome, FrameInfo, FunctionInfo, LineTableEntry, Location, NamedValue, ObjectId,
        ObjectSummary, RequestId, StepDepth, ThreadId, TypeDesc, TypeInfo, VwpValue,
        ERROR_INVALID_EVENT_REQUEST, ERROR_INVALID_FRAME, ERROR_INVALID_FUNCTION,
        ERROR_INVALID_OBJECT, ERROR_INVALID_THREAD, ERROR_INVALID_TYPE,
        ERROR_THREAD_NOT_SUSPENDED, EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION,
        EVENT_KIND_FUNCTION_ENTRY, EVENT_KIND_SINGLE_STEP, EVENT_KIND_THREAD_DEATH,
        EVENT_KIND_VM_EXIT, SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE,
    },
};

#[derive(Clone, Debug, Default)]
pub struct MockVmConfig {
    /// Reply delays keyed by `(command_set, command)`.
    ///
    /// The server still accepts and answers other commands while a delayed
    /// reply is pending.
    pub delayed_replies: Vec<DelayedReply>,
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command_set: u8,
    pub command: u8,
    pub delay: Duration,
}

/// An event request the debugger registered via `EventRequest.Set`, as the
/// mock recorded it.
#[derive(Debug, Clone, PartialEq)]
pub struct MockEventRequest {
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub request_id: RequestId,
    pub modifiers: Vec<MockModifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockModifier {
    LocationOnly {
        location: Location,
    },
    Step {
        thread: ThreadId,
        depth: StepDepth,
    },
    ExceptionMatch {
        type_name: String,
        uncaught_only: bool,
    },
    FunctionMatch {
        name: String,
    },
    Unknown(u8),
}

/// One event the mock should deliver when the debuggee is resumed.
///
/// Request ids are resolved at emission time against the currently registered
/// event requests; an event with no matching live request is dropped, like a
/// real VM that has nothing armed at that location.
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    BreakpointAt {
        thread: ThreadId,
        location: Location,
    },
    StepAt {
        thread: ThreadId,
        location: Location,
    },
    FunctionEntry {
        thread: ThreadId,
        name: String,
        location: Location,
    },
    Exception {
        thread: ThreadId,
        exception: VwpValue,
        type_name: String,
        uncaught: bool,
        location: Location,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    VmExit {
        code: i32,
    },
}

/// What happens on the next resume: optional state mutations, then one
/// composite event packet.
#[derive(Debug, Clone, Default)]
pub struct ScriptTurn {
    /// Replace these threads' stacks before emitting (used to simulate the
    /// debuggee moving between stops).
    pub set_frames: Vec<(ThreadId, Vec<FrameInfo>)>,
    pub events: Vec<ScriptEvent>,
}

impl ScriptTurn {
    pub fn emit(events: Vec<ScriptEvent>) -> Self {
        Self {
            set_frames: Vec::new(),
            events,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MockObject {
    summary: Option<ObjectSummary>,
    children: Vec<NamedValue>,
}

pub struct MockVm {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

impl MockVm {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockVmConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockVmConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            let _ = run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    // World setup.

    pub fn add_thread(&self, thread: ThreadId, name: &str) {
        self.state.threads.lock().insert(thread, name.to_string());
    }

    pub fn set_frames(&self, thread: ThreadId, frames: Vec<FrameInfo>) {
        self.state.frames.lock().insert(thread, frames);
    }

    pub fn set_locals(&self, thread: ThreadId, frame: u64, locals: Vec<NamedValue>) {
        self.state.locals.lock().insert((thread, frame), locals);
    }

    pub fn set_globals(&self, thread: ThreadId, frame: u64, globals: Vec<NamedValue>) {
        self.state.globals.lock().insert((thread, frame), globals);
    }

    pub fn set_object(&self, id: ObjectId, summary: ObjectSummary, children: Vec<NamedValue>) {
        self.state.objects.lock().insert(
            id,
            MockObject {
                summary: Some(summary),
                children,
            },
        );
    }

    /// Register an object id that exists but cannot be introspected:
    /// `Object.Summary` and `Object.Children` reply `INVALID_OBJECT`.
    pub fn set_unreadable_object(&self, id: ObjectId) {
        self.state.unreadable_objects.lock().insert(id);
    }

    pub fn set_function(&self, function_id: u64, name: &str, source_file: &str) {
        self.state.functions.lock().insert(
            function_id,
            FunctionInfo {
                name: name.to_string(),
                source_file: source_file.to_string(),
            },
        );
    }

    pub fn set_line_table(&self, function_id: u64, entries: Vec<LineTableEntry>) {
        self.state.line_tables.lock().insert(function_id, entries);
    }

    pub fn set_type_info(&self, type_desc: TypeDesc, info: TypeInfo) {
        self.state.types.lock().insert(type_desc, info);
    }

    pub fn set_locations_for_line(&self, source_file: &str, line: u32, locations: Vec<Location>) {
        self.state
            .line_locations
            .lock()
            .insert((source_file.to_string(), line), locations);
    }

    pub fn set_eval_result(&self, expression: &str, outcome: EvalOutcome) {
        self.state
            .eval_results
            .lock()
            .insert(expression.to_string(), VecDeque::from([outcome]));
    }

    /// Queue an additional outcome for `expression`. Each evaluation consumes
    /// one queued outcome; the last one repeats once the queue is drained.
    pub fn push_eval_result(&self, expression: &str, outcome: EvalOutcome) {
        self.state
            .eval_results
            .lock()
            .entry(expression.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Queue a turn that fires when `expression` is evaluated, before its
    /// reply goes out. This is how evaluated code hitting a breakpoint is
    /// simulated: the stop event races (or outruns) the evaluation reply.
    pub fn push_eval_turn(&self, expression: &str, turn: ScriptTurn) {
        self.state
            .eval_turns
            .lock()
            .entry(expression.to_string())
            .or_default()
            .push_back(turn);
    }

    /// Mark a thread as already suspended, as after a stop event.
    pub fn suspend_thread(&self, thread: ThreadId) {
        self.state.suspended.lock().insert(thread);
    }

    // Scripted behavior.

    pub fn push_script_turn(&self, turn: ScriptTurn) {
        self.state.script.lock().push_back(turn);
    }

    pub fn push_script_events(&self, events: Vec<ScriptEvent>) {
        self.push_script_turn(ScriptTurn::emit(events));
    }

    // Inspection.

    pub fn event_requests(&self) -> Vec<MockEventRequest> {
        self.state.event_requests.lock().clone()
    }

    pub fn eval_calls(&self) -> Vec<String> {
        self.state.eval_calls.lock().clone()
    }

    pub fn vm_suspend_calls(&self) -> u32 {
        self.state.vm_suspend_calls.load(Ordering::Relaxed)
    }

    pub fn vm_resume_calls(&self) -> u32 {
        self.state.vm_resume_calls.load(Ordering::Relaxed)
    }

    pub fn thread_suspend_calls(&self) -> u32 {
        self.state.thread_suspend_calls.load(Ordering::Relaxed)
    }

    pub fn thread_resume_calls(&self) -> u32 {
        self.state.thread_resume_calls.load(Ordering::Relaxed)
    }

    pub fn dispose_calls(&self) -> u32 {
        self.state.dispose_calls.load(Ordering::Relaxed)
    }
}

impl Drop for MockVm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct State {
    next_request_id: AtomicI32,
    next_packet_id: AtomicU32,
    vm_suspend_calls: AtomicU32,
    vm_resume_calls: AtomicU32,
    thread_suspend_calls: AtomicU32,
    thread_resume_calls: AtomicU32,
    dispose_calls: AtomicU32,
    threads: Mutex<HashMap<ThreadId, String>>,
    suspended: Mutex<HashSet<ThreadId>>,
    frames: Mutex<HashMap<ThreadId, Vec<FrameInfo>>>,
    locals: Mutex<HashMap<(ThreadId, u64), Vec<NamedValue>>>,
    globals: Mutex<HashMap<(ThreadId, u64), Vec<NamedValue>>>,
    objects: Mutex<HashMap<ObjectId, MockObject>>,
    unreadable_objects: Mutex<HashSet<ObjectId>>,
    functions: Mutex<HashMap<u64, FunctionInfo>>,
    line_tables: Mutex<HashMap<u64, Vec<LineTableEntry>>>,
    types: Mutex<HashMap<TypeDesc, TypeInfo>>,
    line_locations: Mutex<HashMap<(String, u32), Vec<Location>>>,
    eval_results: Mutex<HashMap<String, VecDeque<EvalOutcome>>>,
    eval_turns: Mutex<HashMap<String, VecDeque<ScriptTurn>>>,
    eval_calls: Mutex<Vec<String>>,
    event_requests: Mutex<Vec<MockEventRequest>>,
    script: Mutex<VecDeque<ScriptTurn>>,
    delayed_replies: HashMap<(u8, u8), Duration>,
}

impl State {
    fn new(config: MockVmConfig) -> Self {
        let mut delayed_replies = HashMap::new();
        for entry in &config.delayed_replies {
            delayed_replies.insert((entry.command_set, entry.command), entry.delay);
        }

        Self {
            next_request_id: AtomicI32::new(0),
            next_packet_id: AtomicU32::new(0),
            vm_suspend_calls: AtomicU32::new(0),
            vm_resume_calls: AtomicU32::new(0),
            thread_suspend_calls: AtomicU32::new(0),
            thread_resume_calls: AtomicU32::new(0),
            dispose_calls: AtomicU32::new(0),
            threads: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
            frames: Mutex::new(HashMap::new()),
            locals: Mutex::new(HashMap::new()),
            globals: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            unreadable_objects: Mutex::new(HashSet::new()),
            functions: Mutex::new(HashMap::new()),
            line_tables: Mutex::new(HashMap::new()),
            types: Mutex::new(HashMap::new()),
            line_locations: Mutex::new(HashMap::new()),
            eval_results: Mutex::new(HashMap::new()),
            eval_turns: Mutex::new(HashMap::new()),
            eval_calls: Mutex::new(Vec::new()),
            event_requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            delayed_replies,
        }
    }

    fn alloc_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn alloc_packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn reply_delay(&self, command_set: u8, command: u8) -> Option<Duration> {
        self.delayed_replies.get(&(command_set, command)).copied()
    }

    fn thread_exists(&self, thread: ThreadId) -> bool {
        self.threads.lock().contains_key(&thread)
    }

    fn is_suspended(&self, thread: ThreadId) -> bool {
        self.suspended.lock().contains(&thread)
    }

    /// Find the request id for an event about to be emitted, honoring the
    /// registered modifiers. `None` means no live request wants this event.
    fn resolve_request(&self, event: &ScriptEvent) -> Option<(RequestId, u8)> {
        let requests = self.event_requests.lock();
        match event {
            ScriptEvent::BreakpointAt { location, .. } => requests
                .iter()
                .find(|req| {
                    req.event_kind == EVENT_KIND_BREAKPOINT
                        && req.modifiers.iter().any(|m| {
                            matches!(m, MockModifier::LocationOnly { location: l } if l == location)
                        })
                })
                .map(|req| (req.request_id, req.suspend_policy)),
            ScriptEvent::StepAt { thread, .. } => requests
                .iter()
                .find(|req| {
                    req.event_kind == EVENT_KIND_SINGLE_STEP
                        && req.modifiers.iter().any(
                            |m| matches!(m, MockModifier::Step { thread: t, .. } if t == thread),
                        )
                })
                .map(|req| (req.request_id, req.suspend_policy)),
            ScriptEvent::FunctionEntry { name, .. } => requests
                .iter()
                .find(|req| {
                    req.event_kind == EVENT_KIND_FUNCTION_ENTRY
                        && req.modifiers.iter().any(
                            |m| matches!(m, MockModifier::FunctionMatch { name: n } if n == name),
                        )
                })
                .map(|req| (req.request_id, req.suspend_policy)),
            ScriptEvent::Exception {
                type_name, uncaught, ..
            } => requests
                .iter()
                .find(|req| {
                    req.event_kind == EVENT_KIND_EXCEPTION
                        && req.modifiers.iter().any(|m| match m {
                            MockModifier::ExceptionMatch {
                                type_name: pattern,
                                uncaught_only,
                            } => {
                                (pattern.is_empty() || pattern == type_name)
                                    && (!uncaught_only || *uncaught)
                            }
                            _ => false,
                        })
                })
                .map(|req| (req.request_id, req.suspend_policy)),
            // Lifecycle events need no request.
            ScriptEvent::ThreadDeath { .. } | ScriptEvent::VmExit { .. } => {
                Some((0, SUSPEND_POLICY_NONE))
            }
        }
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => {
            let (mut socket, _) = accept?;

            // Handshake: debugger -> "VWP-Handshake", VM echoes back.
            let mut hs = [0u8; HANDSHAKE.len()];
            socket.read_exact(&mut hs).await?;
            if hs != *HANDSHAKE {
                return Ok(());
            }
            socket.write_all(HANDSHAKE).await?;

            let (mut reader, writer) = socket.into_split();
            let writer = Arc::new(tokio::sync::Mutex::new(writer));

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    res = read_packet(&mut reader) => {
                        let Some(packet) = res? else {
                            return Ok(());
                        };
                        handle_packet(&writer, &state, packet).await?;
                    }
                }
            }
        }
    }
}

struct Packet {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_packet(
    socket: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_n) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Ok(None);
    }
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];
    if flags != 0 {
        // The mock only expects commands from the debugger.
        return Ok(None);
    }
    let command_set = header[9];
    let command = header[10];
    let mut payload = vec![0u8; length - HEADER_LEN];
    socket.read_exact(&mut payload).await?;
    Ok(Some(Packet {
        id,
        command_set,
        command,
        payload,
    }))
}

async fn handle_packet(
    writer: &Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    state: &Arc<State>,
    packet: Packet,
) -> std::io::Result<()> {
    let mut r = VwpReader::new(&packet.payload);
    let mut resumed = false;
    let mut eval_turn: Option<ScriptTurn> = None;

    let (reply_error_code, reply_payload) = match (packet.command_set, packet.command) {
        // Vm.AllThreads
        (1, 1) => {
            let threads = state.threads.lock();
            let mut ids: Vec<ThreadId> = threads.keys().copied().collect();
            ids.sort_unstable();
            let mut w = VwpWriter::new();
            w.write_u32(ids.len() as u32);
            for id in ids {
                w.write_u64(id);
            }
            (0, w.into_vec())
        }
        // Vm.Suspend
        (1, 2) => {
            state.vm_suspend_calls.fetch_add(1, Ordering::Relaxed);
            let threads: Vec<ThreadId> = state.threads.lock().keys().copied().collect();
            state.suspended.lock().extend(threads);
            (0, Vec::new())
        }
        // Vm.Resume
        (1, 3) => {
            state.vm_resume_calls.fetch_add(1, Ordering::Relaxed);
            state.suspended.lock().clear();
            resumed = true;
            (0, Vec::new())
        }
        // Vm.Dispose
        (1, 4) => {
            state.dispose_calls.fetch_add(1, Ordering::Relaxed);
            (0, Vec::new())
        }
        // Thread.Name
        (2, 1) => {
            let thread = r.read_u64().unwrap_or(0);
            match state.threads.lock().get(&thread) {
                Some(name) => {
                    let mut w = VwpWriter::new();
                    w.write_string(name);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_THREAD, Vec::new()),
            }
        }
        // Thread.Suspend
        (2, 2) => {
            let thread = r.read_u64().unwrap_or(0);
            if !state.thread_exists(thread) {
                (ERROR_INVALID_THREAD, Vec::new())
            } else {
                state.thread_suspend_calls.fetch_add(1, Ordering::Relaxed);
                state.suspended.lock().insert(thread);
                (0, Vec::new())
            }
        }
        // Thread.Resume
        (2, 3) => {
            let thread = r.read_u64().unwrap_or(0);
            if !state.thread_exists(thread) {
                (ERROR_INVALID_THREAD, Vec::new())
            } else {
                state.thread_resume_calls.fetch_add(1, Ordering::Relaxed);
                state.suspended.lock().remove(&thread);
                resumed = true;
                (0, Vec::new())
            }
        }
        // Thread.Frames
        (2, 4) => {
            let thread = r.read_u64().unwrap_or(0);
            let start = r.read_i32().unwrap_or(0).max(0) as usize;
            let length = r.read_i32().unwrap_or(-1);
            if !state.thread_exists(thread) {
                (ERROR_INVALID_THREAD, Vec::new())
            } else if !state.is_suspended(thread) {
                (ERROR_THREAD_NOT_SUSPENDED, Vec::new())
            } else {
                let frames = state.frames.lock();
                let all = frames.get(&thread).cloned().unwrap_or_default();
                let end = if length < 0 {
                    all.len()
                } else {
                    (start + length as usize).min(all.len())
                };
                let window = if start < end { &all[start..end] } else { &[] };
                let mut w = VwpWriter::new();
                w.write_u32(window.len() as u32);
                for frame in window {
                    w.write_u64(frame.frame_id);
                    w.write_location(&frame.location);
                }
                (0, w.into_vec())
            }
        }
        // Thread.FrameCount
        (2, 5) => {
            let thread = r.read_u64().unwrap_or(0);
            if !state.thread_exists(thread) {
                (ERROR_INVALID_THREAD, Vec::new())
            } else if !state.is_suspended(thread) {
                (ERROR_THREAD_NOT_SUSPENDED, Vec::new())
            } else {
                let count = state
                    .frames
                    .lock()
                    .get(&thread)
                    .map(Vec::len)
                    .unwrap_or(0);
                let mut w = VwpWriter::new();
                w.write_u32(count as u32);
                (0, w.into_vec())
            }
        }
        // Frame.Locals / Frame.Globals
        (3, cmd @ (1 | 2)) => {
            let thread = r.read_u64().unwrap_or(0);
            let frame = r.read_u64().unwrap_or(0);
            if !state.thread_exists(thread) {
                (ERROR_INVALID_THREAD, Vec::new())
            } else if !state.is_suspended(thread) {
                (ERROR_THREAD_NOT_SUSPENDED, Vec::new())
            } else {
                let known_frame = state
                    .frames
                    .lock()
                    .get(&thread)
                    .map(|frames| frames.iter().any(|f| f.frame_id == frame))
                    .unwrap_or(false);
                if !known_frame {
                    (ERROR_INVALID_FRAME, Vec::new())
                } else {
                    let table = if cmd == 1 { &state.locals } else { &state.globals };
                    let values = table.lock().get(&(thread, frame)).cloned().unwrap_or_default();
                    (0, write_named_values(&values))
                }
            }
        }
        // Object.Summary
        (4, 1) => {
            let object = r.read_u64().unwrap_or(0);
            if state.unreadable_objects.lock().contains(&object) {
                (ERROR_INVALID_OBJECT, Vec::new())
            } else {
                match state
                    .objects
                    .lock()
                    .get(&object)
                    .and_then(|obj| obj.summary.clone())
                {
                    Some(summary) => {
                        let mut w = VwpWriter::new();
                        w.write_u64(summary.type_desc);
                        w.write_string(&summary.type_name);
                        w.write_u8(summary.tag.to_wire());
                        w.write_u32(summary.size);
                        match &summary.brief {
                            Some(brief) => {
                                w.write_bool(true);
                                w.write_string(brief);
                            }
                            None => w.write_bool(false),
                        }
                        (0, w.into_vec())
                    }
                    None => (ERROR_INVALID_OBJECT, Vec::new()),
                }
            }
        }
        // Object.Children
        (4, 2) => {
            let object = r.read_u64().unwrap_or(0);
            let start = r.read_u32().unwrap_or(0) as usize;
            let count = r.read_u32().unwrap_or(0) as usize;
            if state.unreadable_objects.lock().contains(&object) {
                (ERROR_INVALID_OBJECT, Vec::new())
            } else {
                match state.objects.lock().get(&object) {
                    Some(obj) => {
                        let end = if count == 0 {
                            obj.children.len()
                        } else {
                            (start + count).min(obj.children.len())
                        };
                        let window = if start < end {
                            obj.children[start..end].to_vec()
                        } else {
                            Vec::new()
                        };
                        (0, write_named_values(&window))
                    }
                    None => (ERROR_INVALID_OBJECT, Vec::new()),
                }
            }
        }
        // Eval.Evaluate
        (5, 1) => {
            let thread = r.read_u64().unwrap_or(0);
            let frame = r.read_u64().unwrap_or(0);
            let expression = r.read_string().unwrap_or_default();
            if !state.thread_exists(thread) {
                (ERROR_INVALID_THREAD, Vec::new())
            } else if !state.is_suspended(thread) {
                (ERROR_THREAD_NOT_SUSPENDED, Vec::new())
            } else {
                let _ = frame;
                state.eval_calls.lock().push(expression.clone());
                eval_turn = state
                    .eval_turns
                    .lock()
                    .get_mut(&expression)
                    .and_then(VecDeque::pop_front);
                let outcome = {
                    let mut results = state.eval_results.lock();
                    results
                        .get_mut(&expression)
                        .and_then(|queue| {
                            if queue.len() > 1 {
                                queue.pop_front()
                            } else {
                                queue.front().cloned()
                            }
                        })
                        .unwrap_or_else(|| {
                            EvalOutcome::Error(format!(
                                "undefined name in expression: {expression}"
                            ))
                        })
                };
                let mut w = VwpWriter::new();
                match outcome {
                    EvalOutcome::Value(value) => {
                        w.write_u8(0);
                        w.write_value(&value);
                    }
                    EvalOutcome::Error(message) => {
                        w.write_u8(1);
                        w.write_string(&message);
                    }
                }
                (0, w.into_vec())
            }
        }
        // EventRequest.Set
        (6, 1) => {
            let event_kind = r.read_u8().unwrap_or(0);
            let suspend_policy = r.read_u8().unwrap_or(0);
            let modifier_count = r.read_u32().unwrap_or(0) as usize;
            let mut modifiers = Vec::with_capacity(modifier_count);
            for _ in 0..modifier_count {
                let kind = r.read_u8().unwrap_or(0);
                let modifier = match kind {
                    1 => MockModifier::LocationOnly {
                        location: r.read_location().unwrap_or(Location {
                            function_id: 0,
                            code_index: 0,
                        }),
                    },
                    2 => MockModifier::Step {
                        thread: r.read_u64().unwrap_or(0),
                        depth: StepDepth::from_wire(r.read_u8().unwrap_or(0))
                            .unwrap_or(StepDepth::Into),
                    },
                    3 => MockModifier::ExceptionMatch {
                        type_name: r.read_string().unwrap_or_default(),
                        uncaught_only: r.read_bool().unwrap_or(false),
                    },
                    4 => MockModifier::FunctionMatch {
                        name: r.read_string().unwrap_or_default(),
                    },
                    other => MockModifier::Unknown(other),
                };
                modifiers.push(modifier);
            }
            let request_id = state.alloc_request_id();
            state.event_requests.lock().push(MockEventRequest {
                event_kind,
                suspend_policy,
                request_id,
                modifiers,
            });
            let mut w = VwpWriter::new();
            w.write_i32(request_id);
            (0, w.into_vec())
        }
        // EventRequest.Clear
        (6, 2) => {
            let event_kind = r.read_u8().unwrap_or(0);
            let request_id = r.read_i32().unwrap_or(0);
            let mut requests = state.event_requests.lock();
            let before = requests.len();
            requests.retain(|req| {
                !(req.event_kind == event_kind && req.request_id == request_id)
            });
            if requests.len() == before {
                (ERROR_INVALID_EVENT_REQUEST, Vec::new())
            } else {
                (0, Vec::new())
            }
        }
        // Meta.FunctionInfo
        (7, 1) => {
            let function_id = r.read_u64().unwrap_or(0);
            match state.functions.lock().get(&function_id) {
                Some(info) => {
                    let mut w = VwpWriter::new();
                    w.write_string(&info.name);
                    w.write_string(&info.source_file);
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_FUNCTION, Vec::new()),
            }
        }
        // Meta.LineTable
        (7, 2) => {
            let function_id = r.read_u64().unwrap_or(0);
            match state.line_tables.lock().get(&function_id) {
                Some(entries) => {
                    let mut w = VwpWriter::new();
                    w.write_u32(entries.len() as u32);
                    for entry in entries {
                        w.write_u64(entry.code_index);
                        w.write_u32(entry.line);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_FUNCTION, Vec::new()),
            }
        }
        // Meta.TypeInfo
        (7, 3) => {
            let type_desc = r.read_u64().unwrap_or(0);
            match state.types.lock().get(&type_desc) {
                Some(info) => {
                    let mut w = VwpWriter::new();
                    w.write_string(&info.name);
                    w.write_u32(info.fields.len() as u32);
                    for (name, field_type) in &info.fields {
                        w.write_string(name);
                        w.write_string(field_type);
                    }
                    (0, w.into_vec())
                }
                None => (ERROR_INVALID_TYPE, Vec::new()),
            }
        }
        // Meta.LocationsForLine
        (7, 4) => {
            let source_file = r.read_string().unwrap_or_default();
            let line = r.read_u32().unwrap_or(0);
            let locations = state
                .line_locations
                .lock()
                .get(&(source_file, line))
                .cloned()
                .unwrap_or_default();
            let mut w = VwpWriter::new();
            w.write_u32(locations.len() as u32);
            for location in &locations {
                w.write_location(location);
            }
            (0, w.into_vec())
        }
        _ => (crate::types::ERROR_NOT_IMPLEMENTED, Vec::new()),
    };

    if let Some(delay) = state.reply_delay(packet.command_set, packet.command) {
        // Delay without blocking the command loop for other requests.
        let writer = writer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let reply = encode_reply(packet.id, reply_error_code, &reply_payload);
            let mut writer = writer.lock().await;
            let _ = writer.write_all(&reply).await;
        });
    } else {
        let reply = encode_reply(packet.id, reply_error_code, &reply_payload);
        let mut writer = writer.lock().await;
        writer.write_all(&reply).await?;
    }

    if let Some(turn) = eval_turn {
        emit_turn(writer, state, turn).await?;
    }
    if resumed && reply_error_code == 0 {
        emit_script_turn(writer, state).await?;
    }

    Ok(())
}

/// Pop the next scripted turn and deliver it as one composite event packet.
async fn emit_script_turn(
    writer: &Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    state: &Arc<State>,
) -> std::io::Result<()> {
    let turn = state.script.lock().pop_front();
    let Some(turn) = turn else {
        return Ok(());
    };
    emit_turn(writer, state, turn).await
}

async fn emit_turn(
    writer: &Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    state: &Arc<State>,
    turn: ScriptTurn,
) -> std::io::Result<()> {
    for (thread, frames) in turn.set_frames {
        state.frames.lock().insert(thread, frames);
    }

    let mut suspend_policy = SUSPEND_POLICY_NONE;
    let mut events = Vec::new();
    for event in turn.events {
        let Some((request_id, policy)) = state.resolve_request(&event) else {
            continue;
        };
        suspend_policy = suspend_policy.max(policy);
        events.push((request_id, event));
    }
    if events.is_empty() {
        return Ok(());
    }

    // Honor the suspend policy before the packet is on the wire, so the
    // debugger can immediately walk stacks.
    if suspend_policy == SUSPEND_POLICY_EVENT_THREAD {
        let mut suspended = state.suspended.lock();
        for (_id, event) in &events {
            match event {
                ScriptEvent::BreakpointAt { thread, .. }
                | ScriptEvent::StepAt { thread, .. }
                | ScriptEvent::FunctionEntry { thread, .. }
                | ScriptEvent::Exception { thread, .. } => {
                    suspended.insert(*thread);
                }
                _ => {}
            }
        }
    } else if suspend_policy > SUSPEND_POLICY_EVENT_THREAD {
        let threads: Vec<ThreadId> = state.threads.lock().keys().copied().collect();
        state.suspended.lock().extend(threads);
    }

    let mut w = VwpWriter::new();
    w.write_u8(suspend_policy);
    w.write_u32(events.len() as u32);
    for (request_id, event) in events {
        match event {
            ScriptEvent::BreakpointAt { thread, location } => {
                w.write_u8(EVENT_KIND_BREAKPOINT);
                w.write_i32(request_id);
                w.write_u64(thread);
                w.write_location(&location);
            }
            ScriptEvent::StepAt { thread, location } => {
                w.write_u8(EVENT_KIND_SINGLE_STEP);
                w.write_i32(request_id);
                w.write_u64(thread);
                w.write_location(&location);
            }
            ScriptEvent::FunctionEntry {
                thread, location, ..
            } => {
                w.write_u8(EVENT_KIND_FUNCTION_ENTRY);
                w.write_i32(request_id);
                w.write_u64(thread);
                w.write_location(&location);
            }
            ScriptEvent::Exception {
                thread,
                exception,
                type_name,
                uncaught,
                location,
            } => {
                w.write_u8(EVENT_KIND_EXCEPTION);
                w.write_i32(request_id);
                w.write_u64(thread);
                w.write_value(&exception);
                w.write_string(&type_name);
                w.write_bool(uncaught);
                w.write_location(&location);
            }
            ScriptEvent::ThreadDeath { thread } => {
                w.write_u8(EVENT_KIND_THREAD_DEATH);
                w.write_i32(request_id);
                w.write_u64(thread);
            }
            ScriptEvent::VmExit { code } => {
                w.write_u8(EVENT_KIND_VM_EXIT);
                w.write_i32(request_id);
                w.write_i32(code);
            }
        }
    }

    let packet = encode_command(state.alloc_packet_id(), 64, 100, &w.into_vec());
    let mut writer = writer.lock().await;
    writer.write_all(&packet).await
}

fn write_named_values(values: &[NamedValue]) -> Vec<u8> {
    let mut w = VwpWriter::new();
    w.write_u32(values.len() as u32);
    for value in values {
        w.write_string(&value.name);
        match &value.declared_type {
            Some(declared) => {
                w.write_bool(true);
                w.write_string(declared);
            }
            None => w.write_bool(false),
        }
        w.write_value(&value.value);
    }
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{EventModifier, VwpClient};
    use crate::types::{RefTag, VwpEvent};

    fn loc(function_id: u64, code_index: u64) -> Location {
        Location {
            function_id,
            code_index,
        }
    }

    #[tokio::test]
    async fn commands_round_trip_through_the_mock() {
        let vm = MockVm::spawn().await.unwrap();
        vm.add_thread(1, "main");
        vm.suspend_thread(1);
        vm.set_frames(
            1,
            vec![FrameInfo {
                frame_id: 100,
                location: loc(7, 0),
            }],
        );
        vm.set_locals(
            1,
            100,
            vec![NamedValue {
                name: "x".to_string(),
                declared_type: Some("Int".to_string()),
                value: VwpValue::Int(42),
            }],
        );
        vm.set_function(7, "main", "main.vela");

        let client = VwpClient::connect(vm.addr()).await.unwrap();

        assert_eq!(client.all_threads().await.unwrap(), vec![1]);
        assert_eq!(client.thread_name(1).await.unwrap(), "main");
        assert_eq!(client.thread_frame_count(1).await.unwrap(), 1);

        let frames = client.thread_frames(1, 0, -1).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_id, 100);

        let locals = client.frame_locals(1, 100).await.unwrap();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].name, "x");
        assert_eq!(locals[0].value, VwpValue::Int(42));

        let info = client.function_info(7).await.unwrap();
        assert_eq!(info.name, "main");
        assert_eq!(info.source_file, "main.vela");
    }

    #[tokio::test]
    async fn scripted_breakpoint_event_is_delivered_on_resume() {
        let vm = MockVm::spawn().await.unwrap();
        vm.add_thread(1, "main");

        let client = VwpClient::connect(vm.addr()).await.unwrap();
        let mut events = client.subscribe_events();

        let request_id = client
            .event_request_set(
                EVENT_KIND_BREAKPOINT,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![EventModifier::LocationOnly {
                    location: loc(7, 3),
                }],
            )
            .await
            .unwrap();

        vm.push_script_events(vec![ScriptEvent::BreakpointAt {
            thread: 1,
            location: loc(7, 3),
        }]);
        client.vm_resume().await.unwrap();

        let event = events.recv().await.unwrap();
        match event {
            VwpEvent::Breakpoint {
                request_id: id,
                thread,
                location,
            } => {
                assert_eq!(id, request_id);
                assert_eq!(thread, 1);
                assert_eq!(location, loc(7, 3));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The event thread is now suspended, so its stack is available.
        vm.set_frames(
            1,
            vec![FrameInfo {
                frame_id: 100,
                location: loc(7, 3),
            }],
        );
        assert_eq!(client.thread_frame_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn events_without_a_live_request_are_dropped() {
        let vm = MockVm::spawn().await.unwrap();
        vm.add_thread(1, "main");

        let client = VwpClient::connect(vm.addr()).await.unwrap();
        let mut events = client.subscribe_events();

        let request_id = client
            .event_request_set(
                EVENT_KIND_BREAKPOINT,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![EventModifier::LocationOnly {
                    location: loc(7, 3),
                }],
            )
            .await
            .unwrap();
        client
            .event_request_clear(EVENT_KIND_BREAKPOINT, request_id)
            .await
            .unwrap();

        vm.push_script_turn(ScriptTurn::emit(vec![
            ScriptEvent::BreakpointAt {
                thread: 1,
                location: loc(7, 3),
            },
            ScriptEvent::VmExit { code: 0 },
        ]));
        client.vm_resume().await.unwrap();

        // Only the exit survives; the breakpoint had no live request.
        match events.recv().await.unwrap() {
            VwpEvent::VmExit { code } => assert_eq!(code, 0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn evaluate_reports_values_and_runtime_errors() {
        let vm = MockVm::spawn().await.unwrap();
        vm.add_thread(1, "main");
        vm.suspend_thread(1);
        vm.set_frames(
            1,
            vec![FrameInfo {
                frame_id: 100,
                location: loc(7, 0),
            }],
        );
        vm.set_eval_result("count", EvalOutcome::Value(VwpValue::Int(3)));

        let client = VwpClient::connect(vm.addr()).await.unwrap();

        assert_eq!(
            client.evaluate(1, 100, "count").await.unwrap(),
            EvalOutcome::Value(VwpValue::Int(3))
        );
        match client.evaluate(1, 100, "missing").await.unwrap() {
            EvalOutcome::Error(message) => {
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(vm.eval_calls(), vec!["count", "missing"]);
    }

    #[tokio::test]
    async fn unreadable_objects_reply_invalid_object() {
        let vm = MockVm::spawn().await.unwrap();
        vm.add_thread(1, "main");
        vm.set_object(
            0x50,
            ObjectSummary {
                type_desc: 9,
                type_name: "Point".to_string(),
                tag: RefTag::Record,
                size: 2,
                brief: None,
            },
            Vec::new(),
        );
        vm.set_unreadable_object(0x51);

        let client = VwpClient::connect(vm.addr()).await.unwrap();

        assert_eq!(client.object_summary(0x50).await.unwrap().type_name, "Point");
        match client.object_summary(0x51).await {
            Err(crate::types::VwpError::VmError(code)) => {
                assert_eq!(code, ERROR_INVALID_OBJECT);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
