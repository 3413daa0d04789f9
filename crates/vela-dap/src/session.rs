//! The debug session: state machine, suspension tracking, and the glue
//! between DAP requests and the VWP connection.
//!
//! One `DebugSession` exists per client connection and holds no persistent
//! state. The lifecycle is `NotStarted → Initialized → Running ⇄ Suspended →
//! Terminated`; `Terminated` is absorbing and every request arriving after it
//! fails with `SESSION_TERMINATED`.
//!
//! Locking discipline: all locks here are `parking_lot` and are never held
//! across an await. VWP calls are made on a clone of the client taken out of
//! the connection slot.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use vela_vdwp::{
    EventModifier, FrameId, RequestId, StepDepth, ThreadId, VwpClient, VwpEvent, VwpValue,
    EVENT_KIND_SINGLE_STEP, SUSPEND_POLICY_ALL, SUSPEND_POLICY_EVENT_THREAD,
};

use crate::{
    breakpoints::{
        BreakpointEngine, BreakpointView, ExceptionBreakpointSpec, FunctionBreakpointSpec,
        HitDecision, SourceBreakpointSpec,
    },
    bridge::SymbolBridge,
    config::DapConfig,
    context::{Frame, SuspendedContext},
    error::{DebugError, DebugResult},
    eval,
    ext::{ExtRegistry, Key},
    refs::{RefTarget, ScopeKind, VarStore},
    value::{Translator, Variable},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Initialized,
    Running,
    Suspended,
    Terminated,
}

/// DAP client properties captured at `initialize`.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_name: Option<String>,
    pub lines_start_at_one: bool,
}

pub const CLIENT_INFO: Key<ClientInfo> = Key::new("client-info");

/// `launch` request arguments.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub port: u16,
}

pub const LAUNCH_OPTIONS: Key<LaunchOptions> = Key::new("launch-options");

/// Something the client must be told about, produced by the event path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Stopped {
        reason: &'static str,
        thread: ThreadId,
        breakpoint_id: Option<i64>,
        hit_count: Option<u64>,
        description: Option<String>,
    },
    Continued {
        thread: ThreadId,
        all_threads: bool,
    },
    Output {
        category: &'static str,
        message: String,
    },
    Exited {
        code: i32,
    },
    Terminated,
}

#[derive(Clone)]
struct Connection {
    client: VwpClient,
    bridge: Arc<SymbolBridge>,
}

#[derive(Debug, Clone, Copy)]
struct StepState {
    request_id: RequestId,
    depth: StepDepth,
    /// Call depth of the frame the step started from.
    origin_depth: u32,
}

pub struct ScopeView {
    pub name: &'static str,
    pub variables_reference: i64,
}

pub struct DebugSession {
    config: DapConfig,
    state: Mutex<SessionState>,
    connection: Mutex<Option<Connection>>,
    engine: BreakpointEngine,
    contexts: RwLock<HashMap<ThreadId, SuspendedContext>>,
    generations: Mutex<HashMap<ThreadId, u64>>,
    frame_threads: Mutex<HashMap<i64, ThreadId>>,
    next_frame_id: AtomicI64,
    var_store: Mutex<VarStore>,
    eval_in_flight: Mutex<HashSet<ThreadId>>,
    /// Stop events per thread that arrived while an evaluation was pending on
    /// that thread; they belong to the evaluation, not the user.
    suppressed_stops: Mutex<HashMap<ThreadId, u32>>,
    steps: Mutex<HashMap<ThreadId, StepState>>,
    ext: Mutex<ExtRegistry>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl DebugSession {
    pub fn new(config: DapConfig) -> Self {
        let suspend_policy = if config.stops.all_threads {
            SUSPEND_POLICY_ALL
        } else {
            SUSPEND_POLICY_EVENT_THREAD
        };
        let eval_timeout = Duration::from_millis(config.evaluation.timeout_ms);
        let max_refs = config.variables.max_refs;
        Self {
            config,
            state: Mutex::new(SessionState::NotStarted),
            connection: Mutex::new(None),
            engine: BreakpointEngine::new(suspend_policy, eval_timeout),
            contexts: RwLock::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            frame_threads: Mutex::new(HashMap::new()),
            next_frame_id: AtomicI64::new(1),
            var_store: Mutex::new(VarStore::new(max_refs)),
            eval_in_flight: Mutex::new(HashSet::new()),
            suppressed_stops: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            ext: Mutex::new(ExtRegistry::new()),
            child: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn config(&self) -> &DapConfig {
        &self.config
    }

    pub fn stops_all_threads(&self) -> bool {
        self.config.stops.all_threads
    }

    fn suspend_policy(&self) -> u8 {
        if self.config.stops.all_threads {
            SUSPEND_POLICY_ALL
        } else {
            SUSPEND_POLICY_EVENT_THREAD
        }
    }

    pub fn client_lines_start_at_one(&self) -> bool {
        self.ext
            .lock()
            .get(CLIENT_INFO)
            .map(|info| info.lines_start_at_one)
            .unwrap_or(true)
    }

    pub fn shutdown_token(&self) -> Option<tokio_util::sync::CancellationToken> {
        self.connection
            .lock()
            .as_ref()
            .map(|conn| conn.client.shutdown_token())
    }

    pub fn subscribe_vm_events(&self) -> Option<tokio::sync::broadcast::Receiver<VwpEvent>> {
        self.connection
            .lock()
            .as_ref()
            .map(|conn| conn.client.subscribe_events())
    }

    fn check_live(&self) -> DebugResult<()> {
        if *self.state.lock() == SessionState::Terminated {
            return Err(DebugError::SessionTerminated);
        }
        Ok(())
    }

    fn connection(&self) -> DebugResult<Connection> {
        self.check_live()?;
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| DebugError::InvalidRequest("no VM connection".to_string()))
    }

    fn current_generation(&self, thread: ThreadId) -> u64 {
        *self.generations.lock().entry(thread).or_insert(0)
    }

    fn bump_generation(&self, thread: ThreadId) {
        *self.generations.lock().entry(thread).or_insert(0) += 1;
    }

    // ---- lifecycle ---------------------------------------------------------

    pub fn initialize(&self, info: ClientInfo) -> DebugResult<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::NotStarted => {
                *state = SessionState::Initialized;
                self.ext.lock().insert(CLIENT_INFO, info);
                Ok(())
            }
            SessionState::Terminated => Err(DebugError::SessionTerminated),
            other => Err(DebugError::InvalidRequest(format!(
                "initialize in state {other:?}"
            ))),
        }
    }

    pub async fn attach(&self, addr: SocketAddr) -> DebugResult<()> {
        self.require_initialized("attach")?;

        match VwpClient::connect(addr).await {
            Ok(client) => {
                self.install_connection(client);
                Ok(())
            }
            Err(err) => {
                // A failed start is fatal for the whole session.
                *self.state.lock() = SessionState::Terminated;
                Err(DebugError::AttachFailure(err.to_string()))
            }
        }
    }

    /// Spawn the debuggee with debugging enabled and attach to it.
    ///
    /// The VM reads `VELA_DEBUG_PORT` at startup and listens there; we retry
    /// the connection while the process boots.
    pub async fn launch(&self, options: LaunchOptions) -> DebugResult<()> {
        self.require_initialized("launch")?;

        let mut command = tokio::process::Command::new(&options.program);
        command
            .args(&options.args)
            .env("VELA_DEBUG_PORT", options.port.to_string())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                *self.state.lock() = SessionState::Terminated;
                return Err(DebugError::LaunchFailure(format!(
                    "failed to spawn {}: {err}",
                    options.program
                )));
            }
        };
        *self.child.lock() = Some(child);

        let addr: SocketAddr = ([127, 0, 0, 1], options.port).into();
        let mut last_error = None;
        for _ in 0..50 {
            match VwpClient::connect(addr).await {
                Ok(client) => {
                    self.ext.lock().insert(LAUNCH_OPTIONS, options);
                    self.install_connection(client);
                    return Ok(());
                }
                Err(err) => {
                    last_error = Some(err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        self.kill_child().await;
        *self.state.lock() = SessionState::Terminated;
        Err(DebugError::LaunchFailure(format!(
            "could not connect to the launched VM on port {}: {}",
            options.port,
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt made".to_string())
        )))
    }

    fn require_initialized(&self, what: &str) -> DebugResult<()> {
        match *self.state.lock() {
            SessionState::Initialized => Ok(()),
            SessionState::Terminated => Err(DebugError::SessionTerminated),
            other => Err(DebugError::InvalidRequest(format!(
                "{what} in state {other:?}"
            ))),
        }
    }

    fn install_connection(&self, client: VwpClient) {
        let bridge = Arc::new(SymbolBridge::new(client.clone()));
        *self.connection.lock() = Some(Connection { client, bridge });
        *self.state.lock() = SessionState::Running;
    }

    pub async fn disconnect(&self, terminate_debuggee: bool) -> DebugResult<()> {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Terminated {
                return Ok(());
            }
            *state = SessionState::Terminated;
        }

        // Bind before awaiting so the guard is not carried across the await.
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            let _ = conn.client.vm_dispose().await;
            conn.client.shutdown();
        }
        if terminate_debuggee {
            self.kill_child().await;
        }
        self.contexts.write().clear();
        Ok(())
    }

    async fn kill_child(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                tracing::debug!(%err, "failed to kill launched debuggee");
            }
        }
    }

    // ---- breakpoints -------------------------------------------------------

    pub async fn set_source_breakpoints(
        &self,
        file: &str,
        specs: Vec<SourceBreakpointSpec>,
    ) -> DebugResult<Vec<BreakpointView>> {
        let conn = self.connection()?;
        self.engine
            .set_source_breakpoints(&conn.client, file, specs)
            .await
    }

    pub async fn set_function_breakpoints(
        &self,
        specs: Vec<FunctionBreakpointSpec>,
    ) -> DebugResult<Vec<BreakpointView>> {
        let conn = self.connection()?;
        self.engine
            .set_function_breakpoints(&conn.client, specs)
            .await
    }

    pub async fn set_exception_breakpoints(
        &self,
        specs: Vec<ExceptionBreakpointSpec>,
    ) -> DebugResult<Vec<BreakpointView>> {
        let conn = self.connection()?;
        self.engine
            .set_exception_breakpoints(&conn.client, specs)
            .await
    }

    // ---- inspection --------------------------------------------------------

    pub async fn threads(&self) -> DebugResult<Vec<(ThreadId, String)>> {
        let conn = self.connection()?;
        let ids = conn.client.all_threads().await?;
        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            let name = conn
                .client
                .thread_name(id)
                .await
                .unwrap_or_else(|_| format!("thread-{id}"));
            threads.push((id, name));
        }
        Ok(threads)
    }

    pub async fn stack_trace(&self, thread: ThreadId) -> DebugResult<Vec<Frame>> {
        self.check_live()?;
        if let Some(context) = self.contexts.read().get(&thread) {
            return Ok(context.frames.clone());
        }

        // With the all-threads stop policy, threads other than the event
        // thread are suspended without a context; build one on first use.
        if self.config.stops.all_threads && *self.state.lock() == SessionState::Suspended {
            let conn = self.connection()?;
            let context = self.build_context(&conn, thread).await?;
            let frames = context.frames.clone();
            self.adopt_context(thread, context)?;
            return Ok(frames);
        }

        Err(DebugError::ThreadNotSuspended(thread))
    }

    pub fn scopes(&self, frame_dap_id: i64) -> DebugResult<Vec<ScopeView>> {
        self.check_live()?;
        let (thread, frame) = self.resolve_frame(frame_dap_id)?;
        let generation = self.current_generation(thread);
        let mut store = self.var_store.lock();
        Ok([ScopeKind::Locals, ScopeKind::Globals]
            .into_iter()
            .map(|kind| ScopeView {
                name: kind.title(),
                variables_reference: store.intern(
                    thread,
                    generation,
                    RefTarget::Scope { frame, kind },
                ),
            })
            .collect())
    }

    pub async fn variables(&self, variables_reference: i64) -> DebugResult<Vec<Variable>> {
        let conn = self.connection()?;
        let entry = self
            .var_store
            .lock()
            .get(variables_reference)
            .ok_or(DebugError::UnknownVariablesReference(variables_reference))?;

        // References die with the suspension that issued them.
        if entry.generation != self.current_generation(entry.thread) {
            return Err(DebugError::StaleReference(variables_reference));
        }

        let translator = Translator {
            client: &conn.client,
            bridge: &conn.bridge,
            store: &self.var_store,
            thread: entry.thread,
            generation: entry.generation,
        };

        match entry.target {
            RefTarget::Scope { frame, kind } => {
                let named = match kind {
                    ScopeKind::Locals => conn.client.frame_locals(entry.thread, frame).await?,
                    ScopeKind::Globals => conn.client.frame_globals(entry.thread, frame).await?,
                };
                let mut variables = Vec::with_capacity(named.len());
                for value in &named {
                    variables.push(translator.translate_named(value).await);
                }
                Ok(variables)
            }
            RefTarget::Object {
                object,
                tag,
                type_desc,
            } => Ok(translator.object_children(object, tag, type_desc).await),
        }
    }

    pub async fn evaluate(&self, frame_dap_id: i64, expression: &str) -> DebugResult<Variable> {
        let conn = self.connection()?;
        let (thread, frame) = self.resolve_frame(frame_dap_id)?;
        let generation = self.current_generation(thread);
        let timeout = Duration::from_millis(self.config.evaluation.timeout_ms);

        // Stops raised by the evaluated expression itself (a breakpoint in a
        // called function) must not surface as user-visible stops.
        self.eval_in_flight.lock().insert(thread);
        let result = eval::evaluate(&conn.client, thread, frame, expression, timeout).await;
        self.eval_in_flight.lock().remove(&thread);

        let value = result?;
        let translator = Translator {
            client: &conn.client,
            bridge: &conn.bridge,
            store: &self.var_store,
            thread,
            generation,
        };
        Ok(translator.translate(expression, None, &value).await)
    }

    fn resolve_frame(&self, frame_dap_id: i64) -> DebugResult<(ThreadId, FrameId)> {
        let thread = *self
            .frame_threads
            .lock()
            .get(&frame_dap_id)
            .ok_or(DebugError::UnknownFrameId(frame_dap_id))?;
        let contexts = self.contexts.read();
        let context = contexts
            .get(&thread)
            .ok_or(DebugError::UnknownFrameId(frame_dap_id))?;
        let frame = context
            .frame_by_dap_id(frame_dap_id)
            .ok_or(DebugError::UnknownFrameId(frame_dap_id))?;
        Ok((thread, frame.frame_id))
    }

    // ---- execution control -------------------------------------------------

    /// Resume one thread (or the whole VM under the all-threads policy).
    /// Returns whether all threads were resumed.
    pub async fn continue_thread(&self, thread: ThreadId) -> DebugResult<bool> {
        let conn = self.connection()?;
        if !self.contexts.read().contains_key(&thread) {
            return Err(DebugError::ThreadNotSuspended(thread));
        }

        if self.config.stops.all_threads {
            self.discard_all_contexts();
            conn.client.vm_resume().await?;
            self.mark_running_if_idle();
            Ok(true)
        } else {
            self.discard_context(thread);
            conn.client.thread_resume(thread).await?;
            self.mark_running_if_idle();
            Ok(false)
        }
    }

    pub async fn step(&self, thread: ThreadId, depth: StepDepth) -> DebugResult<()> {
        let conn = self.connection()?;
        let origin_depth = {
            let contexts = self.contexts.read();
            let context = contexts
                .get(&thread)
                .ok_or(DebugError::ThreadNotSuspended(thread))?;
            context.depth()
        };

        // One step request per thread; replace any leftover one. Drop the
        // lock before the clear call goes out.
        let previous = self.steps.lock().remove(&thread);
        if let Some(previous) = previous {
            let _ = conn
                .client
                .event_request_clear(EVENT_KIND_SINGLE_STEP, previous.request_id)
                .await;
        }

        let request_id = conn
            .client
            .event_request_set(
                EVENT_KIND_SINGLE_STEP,
                self.suspend_policy(),
                vec![EventModifier::Step { thread, depth }],
            )
            .await?;
        self.steps.lock().insert(
            thread,
            StepState {
                request_id,
                depth,
                origin_depth,
            },
        );

        self.discard_context(thread);
        conn.client.thread_resume(thread).await?;
        self.mark_running_if_idle();
        Ok(())
    }

    /// Suspend a running thread. The VM emits no event for an explicit
    /// suspend, so the caller synthesizes `stopped(reason="pause")`.
    pub async fn pause(&self, thread: ThreadId) -> DebugResult<()> {
        let conn = self.connection()?;
        if self.contexts.read().contains_key(&thread) {
            return Err(DebugError::ThreadAlreadySuspended(thread));
        }

        conn.client.thread_suspend(thread).await?;
        let context = self.build_context(&conn, thread).await?;
        self.adopt_context(thread, context)?;
        Ok(())
    }

    fn discard_context(&self, thread: ThreadId) {
        if let Some(context) = self.contexts.write().remove(&thread) {
            let mut frame_threads = self.frame_threads.lock();
            for frame in &context.frames {
                frame_threads.remove(&frame.dap_id);
            }
        }
        self.bump_generation(thread);
    }

    fn discard_all_contexts(&self) {
        let threads: Vec<ThreadId> = self.contexts.read().keys().copied().collect();
        for thread in threads {
            self.discard_context(thread);
        }
    }

    fn mark_running_if_idle(&self) {
        if self.contexts.read().is_empty() {
            let mut state = self.state.lock();
            if *state == SessionState::Suspended {
                *state = SessionState::Running;
            }
        }
    }

    async fn build_context(
        &self,
        conn: &Connection,
        thread: ThreadId,
    ) -> DebugResult<SuspendedContext> {
        let generation = self.current_generation(thread);
        let raw = conn.client.thread_frames(thread, 0, -1).await?;
        let mut frames = Vec::with_capacity(raw.len());
        for (depth, info) in raw.iter().enumerate() {
            let function_name = conn
                .bridge
                .function_name_of(info.location.function_id)
                .await
                .unwrap_or_else(|| format!("<fn {:#x}>", info.location.function_id));
            let source = conn.bridge.source_location_of(info.location).await;
            frames.push(Frame {
                dap_id: self.next_frame_id.fetch_add(1, Ordering::Relaxed),
                frame_id: info.frame_id,
                depth: depth as u32,
                function_name,
                source_file: source.as_ref().map(|(file, _)| file.clone()),
                line: source.map(|(_, line)| line),
            });
        }
        Ok(SuspendedContext {
            thread,
            generation,
            frames,
        })
    }

    fn adopt_context(&self, thread: ThreadId, context: SuspendedContext) -> DebugResult<()> {
        {
            let mut contexts = self.contexts.write();
            if contexts.contains_key(&thread) {
                return Err(DebugError::ThreadAlreadySuspended(thread));
            }
            let mut frame_threads = self.frame_threads.lock();
            for frame in &context.frames {
                frame_threads.insert(frame.dap_id, thread);
            }
            contexts.insert(thread, context);
        }
        let mut state = self.state.lock();
        if *state == SessionState::Running {
            *state = SessionState::Suspended;
        }
        Ok(())
    }

    // ---- VM event handling -------------------------------------------------

    /// Digest one VM event into the DAP events the client must see.
    ///
    /// Runs on the single event task, so stop handling is serialized and
    /// per-thread event ordering is preserved.
    pub async fn handle_vm_event(&self, event: VwpEvent) -> Vec<SessionEvent> {
        if *self.state.lock() == SessionState::Terminated {
            return Vec::new();
        }

        // A stop that arrived while an evaluation was pending on its thread
        // was raised by the evaluated code; the user never sees it.
        if let Some(thread) = stop_event_thread(&event) {
            if self.consume_suppressed_stop(thread) {
                tracing::debug!(thread, "dropping stop raised by an evaluation");
                if !self.contexts.read().contains_key(&thread) {
                    if let Ok(conn) = self.connection() {
                        self.resume_silently(&conn, thread).await;
                    }
                }
                return Vec::new();
            }
        }

        match event {
            VwpEvent::Breakpoint {
                request_id, thread, ..
            } => {
                self.handle_hit(request_id, thread, "breakpoint").await
            }
            VwpEvent::FunctionEntry {
                request_id, thread, ..
            } => {
                self.handle_hit(request_id, thread, "function breakpoint")
                    .await
            }
            VwpEvent::SingleStep {
                request_id, thread, ..
            } => self.handle_step_event(request_id, thread).await,
            VwpEvent::Exception {
                request_id,
                thread,
                exception,
                type_name,
                uncaught,
                ..
            } => {
                self.handle_exception(request_id, thread, exception, type_name, uncaught)
                    .await
            }
            VwpEvent::ThreadDeath { thread } => {
                self.discard_context(thread);
                self.generations.lock().remove(&thread);
                self.steps.lock().remove(&thread);
                self.mark_running_if_idle();
                Vec::new()
            }
            VwpEvent::VmExit { code } => {
                *self.state.lock() = SessionState::Terminated;
                if let Some(conn) = self.connection.lock().take() {
                    conn.client.shutdown();
                }
                vec![SessionEvent::Exited { code }, SessionEvent::Terminated]
            }
        }
    }

    async fn handle_hit(
        &self,
        request_id: RequestId,
        thread: ThreadId,
        reason: &'static str,
    ) -> Vec<SessionEvent> {
        let Ok(conn) = self.connection() else {
            return Vec::new();
        };

        if self.eval_in_flight.lock().contains(&thread) {
            self.resume_silently(&conn, thread).await;
            return Vec::new();
        }

        match self.decide_hit_guarded(&conn, request_id, thread).await {
            None => {
                // Event raced the removal of its breakpoint.
                tracing::debug!(request_id, thread, "hit for an unknown breakpoint request");
                self.resume_silently(&conn, thread).await;
                Vec::new()
            }
            Some(HitDecision::Resume { breakpoint_id }) => {
                tracing::trace!(breakpoint_id, thread, "breakpoint hit filtered out");
                self.resume_silently(&conn, thread).await;
                Vec::new()
            }
            Some(HitDecision::Stop {
                breakpoint_id,
                hit_count,
                output,
            }) => {
                let mut events = Vec::new();
                if let Some(message) = output {
                    events.push(SessionEvent::Output {
                        category: "console",
                        message,
                    });
                }
                match self.stop_thread(&conn, thread).await {
                    Ok(()) => events.push(SessionEvent::Stopped {
                        reason,
                        thread,
                        breakpoint_id: Some(breakpoint_id),
                        hit_count: Some(hit_count),
                        description: None,
                    }),
                    Err(err) => {
                        tracing::warn!(thread, %err, "could not snapshot stopped thread");
                        self.resume_silently(&conn, thread).await;
                    }
                }
                events
            }
        }
    }

    async fn handle_step_event(&self, request_id: RequestId, thread: ThreadId) -> Vec<SessionEvent> {
        let Ok(conn) = self.connection() else {
            return Vec::new();
        };

        let pending = self.steps.lock().get(&thread).copied();
        let step = match pending {
            Some(step) if step.request_id == request_id => step,
            _ => {
                tracing::debug!(request_id, thread, "step event without a pending step");
                self.resume_silently(&conn, thread).await;
                return Vec::new();
            }
        };

        // The VM reports every step notification; depth filtering happens
        // here so the client sees exactly one stop per step request.
        let depth_now = match conn.client.thread_frame_count(thread).await {
            Ok(depth) => depth,
            Err(err) => {
                tracing::warn!(thread, %err, "frame count unavailable during step");
                step.origin_depth
            }
        };
        let arrived = match step.depth {
            StepDepth::Into => true,
            StepDepth::Over => depth_now <= step.origin_depth,
            StepDepth::Out => depth_now < step.origin_depth,
        };
        if !arrived {
            self.resume_silently(&conn, thread).await;
            return Vec::new();
        }

        self.steps.lock().remove(&thread);
        let _ = conn
            .client
            .event_request_clear(EVENT_KIND_SINGLE_STEP, request_id)
            .await;

        match self.stop_thread(&conn, thread).await {
            Ok(()) => vec![SessionEvent::Stopped {
                reason: "step",
                thread,
                breakpoint_id: None,
                hit_count: None,
                description: None,
            }],
            Err(err) => {
                tracing::warn!(thread, %err, "could not snapshot stepped thread");
                self.resume_silently(&conn, thread).await;
                Vec::new()
            }
        }
    }

    async fn handle_exception(
        &self,
        request_id: RequestId,
        thread: ThreadId,
        exception: VwpValue,
        type_name: String,
        uncaught: bool,
    ) -> Vec<SessionEvent> {
        let Ok(conn) = self.connection() else {
            return Vec::new();
        };

        if self.eval_in_flight.lock().contains(&thread) {
            self.resume_silently(&conn, thread).await;
            return Vec::new();
        }

        // Exception filters are engine-owned breakpoints: same ids, hit
        // counts, and condition gating as the location kinds.
        let decision = match self.decide_hit_guarded(&conn, request_id, thread).await {
            None => {
                tracing::debug!(request_id, thread, "exception for an unknown filter request");
                self.resume_silently(&conn, thread).await;
                return Vec::new();
            }
            Some(HitDecision::Resume { breakpoint_id }) => {
                tracing::trace!(breakpoint_id, thread, "exception hit filtered out");
                self.resume_silently(&conn, thread).await;
                return Vec::new();
            }
            Some(decision) => decision,
        };

        let description = match exception.object_id() {
            Some(object) => match conn.client.object_summary(object).await {
                Ok(summary) => match summary.brief {
                    Some(brief) if !brief.is_empty() => format!("{type_name}: {brief}"),
                    _ => type_name.clone(),
                },
                Err(_) => type_name.clone(),
            },
            None => type_name.clone(),
        };
        let description = if uncaught {
            format!("uncaught {description}")
        } else {
            description
        };

        let HitDecision::Stop {
            breakpoint_id,
            hit_count,
            output,
        } = decision
        else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(message) = output {
            events.push(SessionEvent::Output {
                category: "console",
                message,
            });
        }
        match self.stop_thread(&conn, thread).await {
            Ok(()) => events.push(SessionEvent::Stopped {
                reason: "exception",
                thread,
                breakpoint_id: Some(breakpoint_id),
                hit_count: Some(hit_count),
                description: Some(description),
            }),
            Err(err) => {
                tracing::warn!(thread, %err, "could not snapshot thread after exception");
                self.resume_silently(&conn, thread).await;
            }
        }
        events
    }

    async fn stop_thread(&self, conn: &Connection, thread: ThreadId) -> DebugResult<()> {
        let context = self.build_context(conn, thread).await?;
        self.adopt_context(thread, context)
    }

    /// Run the engine's stop decision with the event thread marked as
    /// evaluating, so stops raised by a breakpoint condition are kept off the
    /// client.
    ///
    /// Any stop event the VM sent for this thread during the decision (the
    /// condition expression hitting another breakpoint) is recorded and
    /// dropped when the event task gets to it.
    async fn decide_hit_guarded(
        &self,
        conn: &Connection,
        request_id: RequestId,
        thread: ThreadId,
    ) -> Option<HitDecision> {
        let mut nested = conn.client.subscribe_events();
        self.eval_in_flight.lock().insert(thread);
        let decision = self.engine.decide_hit(&conn.client, request_id, thread).await;
        self.eval_in_flight.lock().remove(&thread);

        let mut swallowed = 0u32;
        while let Ok(event) = nested.try_recv() {
            if stop_event_thread(&event) == Some(thread) {
                swallowed += 1;
            }
        }
        if swallowed > 0 {
            *self.suppressed_stops.lock().entry(thread).or_insert(0) += swallowed;
        }
        decision
    }

    fn consume_suppressed_stop(&self, thread: ThreadId) -> bool {
        let mut suppressed = self.suppressed_stops.lock();
        match suppressed.get_mut(&thread) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    suppressed.remove(&thread);
                }
                true
            }
            None => false,
        }
    }

    async fn resume_silently(&self, conn: &Connection, thread: ThreadId) {
        // Under the all-threads policy the whole VM may only be resumed while
        // no reported stop is live; otherwise a filtered hit on one thread
        // would wake threads the client still holds suspended state for.
        if self.config.stops.all_threads && self.contexts.read().is_empty() {
            if let Err(err) = conn.client.vm_resume().await {
                tracing::debug!(thread, %err, "silent resume failed");
            }
            return;
        }
        if let Err(err) = conn.client.thread_resume(thread).await {
            tracing::debug!(thread, %err, "silent resume failed");
        }
    }
}

/// The suspended thread of a stop-kind event; lifecycle events have none.
fn stop_event_thread(event: &VwpEvent) -> Option<ThreadId> {
    match event {
        VwpEvent::Breakpoint { thread, .. }
        | VwpEvent::FunctionEntry { thread, .. }
        | VwpEvent::SingleStep { thread, .. }
        | VwpEvent::Exception { thread, .. } => Some(*thread),
        VwpEvent::ThreadDeath { .. } | VwpEvent::VmExit { .. } => None,
    }
}
