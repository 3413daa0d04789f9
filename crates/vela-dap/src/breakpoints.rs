//! Breakpoint engine: line, function, and exception breakpoints, with
//! conditions and hit conditions.
//!
//! The engine owns every breakpoint for the whole session and maps VWP event
//! request ids back to breakpoints when the VM reports a hit. The stop
//! decision is made here; the session only acts on it.
//!
//! Decision policy: `hit_count` increments on every runtime stop at the
//! location, before any condition runs. The hit condition is checked first
//! (it is cheap and local), then the condition expression is evaluated in the
//! innermost frame. A condition that cannot be evaluated stops the thread
//! anyway, with the evaluation error attached, so a broken condition loses
//! filtering rather than hiding stops.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use vela_vdwp::{
    EventModifier, RequestId, ThreadId, VwpClient, EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION,
    EVENT_KIND_FUNCTION_ENTRY,
};

use crate::{
    error::DebugResult,
    eval::{self, condition_holds},
};

/// One entry of a `setBreakpoints` request.
#[derive(Debug, Clone)]
pub struct SourceBreakpointSpec {
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

/// One entry of a `setFunctionBreakpoints` request.
#[derive(Debug, Clone)]
pub struct FunctionBreakpointSpec {
    pub name: String,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

/// One filter of a `setExceptionBreakpoints` request (`all` or `uncaught`),
/// with the optional condition from `filterOptions`.
#[derive(Debug, Clone)]
pub struct ExceptionBreakpointSpec {
    pub filter: String,
    pub condition: Option<String>,
}

/// What the client gets back for a registered breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointView {
    pub id: i64,
    pub verified: bool,
    pub line: Option<u32>,
}

/// Outcome of a breakpoint or function-entry hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitDecision {
    /// Conditions held (or failed to evaluate); suspend and report.
    Stop {
        breakpoint_id: i64,
        hit_count: u64,
        /// Present when the condition could not be evaluated; forwarded to
        /// the client as an `output` event.
        output: Option<String>,
    },
    /// A condition filtered this hit out; resume silently.
    Resume { breakpoint_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    Eq(u64),
    Gt(u64),
    Ge(u64),
    Multiple(u64),
}

impl HitCondition {
    /// Accepts `N`, `== N`, `> N`, `>= N`, `% N`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (op, rest) = if let Some(rest) = text.strip_prefix("==") {
            ("==", rest)
        } else if let Some(rest) = text.strip_prefix(">=") {
            (">=", rest)
        } else if let Some(rest) = text.strip_prefix('>') {
            (">", rest)
        } else if let Some(rest) = text.strip_prefix('%') {
            ("%", rest)
        } else {
            ("==", text)
        };
        let n: u64 = rest.trim().parse().ok()?;
        match op {
            "==" => Some(Self::Eq(n)),
            ">" => Some(Self::Gt(n)),
            ">=" => Some(Self::Ge(n)),
            "%" if n > 0 => Some(Self::Multiple(n)),
            _ => None,
        }
    }

    pub fn satisfied(self, hit_count: u64) -> bool {
        match self {
            Self::Eq(n) => hit_count == n,
            Self::Gt(n) => hit_count > n,
            Self::Ge(n) => hit_count >= n,
            Self::Multiple(n) => hit_count % n == 0,
        }
    }
}

#[derive(Debug)]
struct LineRecord {
    id: i64,
    line: u32,
    condition: Option<String>,
    hit_condition: Option<HitCondition>,
    hit_count: u64,
    request_ids: Vec<RequestId>,
    verified: bool,
}

#[derive(Debug)]
struct FunctionRecord {
    id: i64,
    name: String,
    condition: Option<String>,
    hit_condition: Option<HitCondition>,
    hit_count: u64,
    request_id: Option<RequestId>,
}

#[derive(Debug)]
struct ExceptionRecord {
    id: i64,
    filter: String,
    condition: Option<String>,
    hit_count: u64,
    request_id: Option<RequestId>,
}

#[derive(Default)]
struct EngineState {
    line: HashMap<String, Vec<LineRecord>>,
    function: Vec<FunctionRecord>,
    exception: Vec<ExceptionRecord>,
    by_request: HashMap<RequestId, i64>,
}

pub struct BreakpointEngine {
    next_id: AtomicI64,
    suspend_policy: u8,
    eval_timeout: Duration,
    state: Mutex<EngineState>,
}

impl BreakpointEngine {
    pub fn new(suspend_policy: u8, eval_timeout: Duration) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            suspend_policy,
            eval_timeout,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replace the breakpoint set of one file.
    ///
    /// Entries matching an existing breakpoint by line keep their id and
    /// accumulated `hit_count`; everything else in the file is cleared. A
    /// line the VM reports no executable code for registers as unverified and
    /// installs no event request.
    pub async fn set_source_breakpoints(
        &self,
        client: &VwpClient,
        file: &str,
        specs: Vec<SourceBreakpointSpec>,
    ) -> DebugResult<Vec<BreakpointView>> {
        let old = {
            let mut state = self.state.lock();
            let old = state.line.remove(file).unwrap_or_default();
            for record in &old {
                for request_id in &record.request_ids {
                    state.by_request.remove(request_id);
                }
            }
            old
        };

        for record in &old {
            for request_id in &record.request_ids {
                // Best effort: a request the VM no longer knows is already
                // gone.
                let _ = client
                    .event_request_clear(EVENT_KIND_BREAKPOINT, *request_id)
                    .await;
            }
        }

        let mut records = Vec::with_capacity(specs.len());
        let mut views = Vec::with_capacity(specs.len());

        for spec in specs {
            let (id, hit_count) = match old.iter().find(|record| record.line == spec.line) {
                Some(previous) => (previous.id, previous.hit_count),
                None => (self.alloc_id(), 0),
            };

            let locations = client.locations_for_line(file, spec.line).await?;
            let verified = !locations.is_empty();

            let mut request_ids = Vec::with_capacity(locations.len());
            for location in locations {
                let request_id = client
                    .event_request_set(
                        EVENT_KIND_BREAKPOINT,
                        self.suspend_policy,
                        vec![EventModifier::LocationOnly { location }],
                    )
                    .await?;
                request_ids.push(request_id);
            }

            views.push(BreakpointView {
                id,
                verified,
                line: Some(spec.line),
            });
            records.push(LineRecord {
                id,
                line: spec.line,
                condition: spec.condition,
                hit_condition: parse_hit_condition(spec.hit_condition.as_deref()),
                hit_count,
                request_ids,
                verified,
            });
        }

        let mut state = self.state.lock();
        for record in &records {
            for request_id in &record.request_ids {
                state.by_request.insert(*request_id, record.id);
            }
        }
        state.line.insert(file.to_string(), records);
        Ok(views)
    }

    /// Replace the whole function breakpoint set.
    pub async fn set_function_breakpoints(
        &self,
        client: &VwpClient,
        specs: Vec<FunctionBreakpointSpec>,
    ) -> DebugResult<Vec<BreakpointView>> {
        let old = {
            let mut state = self.state.lock();
            let old = std::mem::take(&mut state.function);
            for record in &old {
                if let Some(request_id) = record.request_id {
                    state.by_request.remove(&request_id);
                }
            }
            old
        };

        for record in &old {
            if let Some(request_id) = record.request_id {
                let _ = client
                    .event_request_clear(EVENT_KIND_FUNCTION_ENTRY, request_id)
                    .await;
            }
        }

        let mut records = Vec::with_capacity(specs.len());
        let mut views = Vec::with_capacity(specs.len());

        for spec in specs {
            let (id, hit_count) = match old.iter().find(|record| record.name == spec.name) {
                Some(previous) => (previous.id, previous.hit_count),
                None => (self.alloc_id(), 0),
            };

            let request_id = client
                .event_request_set(
                    EVENT_KIND_FUNCTION_ENTRY,
                    self.suspend_policy,
                    vec![EventModifier::FunctionMatch {
                        name: spec.name.clone(),
                    }],
                )
                .await?;

            views.push(BreakpointView {
                id,
                verified: true,
                line: None,
            });
            records.push(FunctionRecord {
                id,
                name: spec.name,
                condition: spec.condition,
                hit_condition: parse_hit_condition(spec.hit_condition.as_deref()),
                hit_count,
                request_id: Some(request_id),
            });
        }

        let mut state = self.state.lock();
        for record in &records {
            if let Some(request_id) = record.request_id {
                state.by_request.insert(request_id, record.id);
            }
        }
        state.function = records;
        Ok(views)
    }

    /// Replace the exception breakpoint set from DAP filter ids (`all`,
    /// `uncaught`).
    ///
    /// Exception filters are ordinary breakpoints to the engine: they get an
    /// id and a hit count, a re-sent filter keeps both, and hits run through
    /// [`BreakpointEngine::decide_hit`] like every other kind.
    pub async fn set_exception_breakpoints(
        &self,
        client: &VwpClient,
        specs: Vec<ExceptionBreakpointSpec>,
    ) -> DebugResult<Vec<BreakpointView>> {
        let old = {
            let mut state = self.state.lock();
            let old = std::mem::take(&mut state.exception);
            for record in &old {
                if let Some(request_id) = record.request_id {
                    state.by_request.remove(&request_id);
                }
            }
            old
        };

        for record in &old {
            if let Some(request_id) = record.request_id {
                let _ = client
                    .event_request_clear(EVENT_KIND_EXCEPTION, request_id)
                    .await;
            }
        }

        let mut records = Vec::with_capacity(specs.len());
        let mut views = Vec::with_capacity(specs.len());

        for spec in specs {
            let (id, hit_count) = match old.iter().find(|record| record.filter == spec.filter) {
                Some(previous) => (previous.id, previous.hit_count),
                None => (self.alloc_id(), 0),
            };

            let uncaught_only = match spec.filter.as_str() {
                "all" => Some(false),
                "uncaught" => Some(true),
                other => {
                    tracing::warn!(filter = other, "unknown exception filter");
                    None
                }
            };
            let request_id = match uncaught_only {
                Some(uncaught_only) => Some(
                    client
                        .event_request_set(
                            EVENT_KIND_EXCEPTION,
                            self.suspend_policy,
                            vec![EventModifier::ExceptionMatch {
                                type_name: String::new(),
                                uncaught_only,
                            }],
                        )
                        .await?,
                ),
                None => None,
            };

            views.push(BreakpointView {
                id,
                verified: request_id.is_some(),
                line: None,
            });
            records.push(ExceptionRecord {
                id,
                filter: spec.filter,
                condition: spec.condition,
                hit_count,
                request_id,
            });
        }

        let mut state = self.state.lock();
        for record in &records {
            if let Some(request_id) = record.request_id {
                state.by_request.insert(request_id, record.id);
            }
        }
        state.exception = records;
        Ok(views)
    }

    /// Decide what to do about a breakpoint or function-entry event.
    ///
    /// `None` means the request id is not ours any more (the breakpoint was
    /// removed while its last event was in flight); the caller resumes.
    pub async fn decide_hit(
        &self,
        client: &VwpClient,
        request_id: RequestId,
        thread: ThreadId,
    ) -> Option<HitDecision> {
        let (breakpoint_id, condition, hit_condition, hit_count) = {
            let mut state = self.state.lock();
            let id = *state.by_request.get(&request_id)?;
            let mut snapshot = None;
            if let Some(record) = state.line.values_mut().flatten().find(|record| record.id == id)
            {
                record.hit_count += 1;
                snapshot = Some((
                    record.condition.clone(),
                    record.hit_condition,
                    record.hit_count,
                ));
            }
            if snapshot.is_none() {
                if let Some(record) = state.function.iter_mut().find(|record| record.id == id) {
                    record.hit_count += 1;
                    snapshot = Some((
                        record.condition.clone(),
                        record.hit_condition,
                        record.hit_count,
                    ));
                }
            }
            if snapshot.is_none() {
                if let Some(record) = state.exception.iter_mut().find(|record| record.id == id) {
                    record.hit_count += 1;
                    snapshot = Some((record.condition.clone(), None, record.hit_count));
                }
            }
            let (condition, hit_condition, hit_count) = snapshot?;
            (id, condition, hit_condition, hit_count)
        };

        if let Some(hit_condition) = hit_condition {
            if !hit_condition.satisfied(hit_count) {
                return Some(HitDecision::Resume { breakpoint_id });
            }
        }

        let Some(condition) = condition else {
            return Some(HitDecision::Stop {
                breakpoint_id,
                hit_count,
                output: None,
            });
        };

        match self.evaluate_condition(client, thread, &condition).await {
            Ok(true) => Some(HitDecision::Stop {
                breakpoint_id,
                hit_count,
                output: None,
            }),
            Ok(false) => Some(HitDecision::Resume { breakpoint_id }),
            Err(message) => Some(HitDecision::Stop {
                breakpoint_id,
                hit_count,
                output: Some(format!(
                    "breakpoint condition `{condition}` failed: {message}"
                )),
            }),
        }
    }

    async fn evaluate_condition(
        &self,
        client: &VwpClient,
        thread: ThreadId,
        condition: &str,
    ) -> Result<bool, String> {
        let frames = client
            .thread_frames(thread, 0, 1)
            .await
            .map_err(|err| err.to_string())?;
        let frame = frames
            .first()
            .ok_or_else(|| "thread has no frames".to_string())?;
        let value = eval::evaluate(client, thread, frame.frame_id, condition, self.eval_timeout)
            .await
            .map_err(|err| err.to_string())?;
        condition_holds(&value)
    }

    pub fn hit_count(&self, breakpoint_id: i64) -> Option<u64> {
        let state = self.state.lock();
        state
            .line
            .values()
            .flatten()
            .find(|record| record.id == breakpoint_id)
            .map(|record| record.hit_count)
            .or_else(|| {
                state
                    .function
                    .iter()
                    .find(|record| record.id == breakpoint_id)
                    .map(|record| record.hit_count)
            })
            .or_else(|| {
                state
                    .exception
                    .iter()
                    .find(|record| record.id == breakpoint_id)
                    .map(|record| record.hit_count)
            })
    }
}

fn parse_hit_condition(text: Option<&str>) -> Option<HitCondition> {
    let text = text?;
    match HitCondition::parse(text) {
        Some(parsed) => Some(parsed),
        None => {
            tracing::warn!(hit_condition = text, "ignoring unparseable hit condition");
            None
        }
    }
}
