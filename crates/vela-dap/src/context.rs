//! Suspended thread contexts.

use serde_json::{json, Value};
use vela_vdwp::{FrameId, ThreadId};

/// One stack entry, snapshotted at suspension time.
///
/// `dap_id` is the frame identifier handed to the client; it is unique across
/// the session so a frame can be found without the client echoing the thread
/// id back.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub dap_id: i64,
    pub frame_id: FrameId,
    /// 0 = innermost.
    pub depth: u32,
    pub function_name: String,
    pub source_file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    pub fn to_json(&self, line_offset: i64) -> Value {
        json!({
            "id": self.dap_id,
            "name": self.function_name,
            "source": self.source_file.as_ref().map(|path| json!({ "path": path })),
            "line": self.line.map(|line| i64::from(line) + line_offset).unwrap_or(0),
            "column": 0,
        })
    }
}

/// The paused state of exactly one thread.
///
/// Created on an accepted stop, destroyed on resume. The frame list is an
/// immutable snapshot: requests served from it never re-query a thread that
/// may have moved on. `generation` stamps every variable reference issued
/// while this context is live.
#[derive(Debug, Clone)]
pub struct SuspendedContext {
    pub thread: ThreadId,
    pub generation: u64,
    pub frames: Vec<Frame>,
}

impl SuspendedContext {
    pub fn frame_by_dap_id(&self, dap_id: i64) -> Option<&Frame> {
        self.frames.iter().find(|frame| frame.dap_id == dap_id)
    }

    /// Call depth at suspension time; step requests record this as their
    /// origin.
    pub fn depth(&self) -> u32 {
        self.frames.len() as u32
    }
}
