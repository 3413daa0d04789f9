use thiserror::Error;
use vela_vdwp::{ThreadId, VwpError};

pub type DebugResult<T> = Result<T, DebugError>;

/// Session-level error taxonomy.
///
/// Every variant carries a stable short code (see [`DebugError::code`]) that
/// is prefixed to the DAP error message, so clients and tests can tell
/// invariant violations (`STALE_REFERENCE`, `THREAD_ALREADY_SUSPENDED`) apart
/// from transient runtime conditions.
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("vwp: {0}")]
    Wire(#[from] VwpError),
    #[error("variablesReference {0} was issued in an earlier suspension")]
    StaleReference(i64),
    #[error("unknown variablesReference {0}")]
    UnknownVariablesReference(i64),
    #[error("unknown frameId {0}")]
    UnknownFrameId(i64),
    #[error("session is terminated")]
    SessionTerminated,
    #[error("launch failed: {0}")]
    LaunchFailure(String),
    #[error("attach failed: {0}")]
    AttachFailure(String),
    #[error("thread {0} already has a suspended context")]
    ThreadAlreadySuspended(ThreadId),
    #[error("thread {0} is not suspended")]
    ThreadNotSuspended(ThreadId),
    #[error("evaluation failed: {0}")]
    EvalFailed(String),
    #[error("evaluation timed out")]
    EvalTimeout,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DebugError {
    pub fn code(&self) -> &'static str {
        match self {
            DebugError::Wire(_) => "RUNTIME_ERROR",
            DebugError::StaleReference(_) => "STALE_REFERENCE",
            DebugError::UnknownVariablesReference(_) => "UNKNOWN_REFERENCE",
            DebugError::UnknownFrameId(_) => "UNKNOWN_FRAME",
            DebugError::SessionTerminated => "SESSION_TERMINATED",
            DebugError::LaunchFailure(_) => "LAUNCH_FAILURE",
            DebugError::AttachFailure(_) => "ATTACH_FAILURE",
            DebugError::ThreadAlreadySuspended(_) => "THREAD_ALREADY_SUSPENDED",
            DebugError::ThreadNotSuspended(_) => "THREAD_NOT_SUSPENDED",
            DebugError::EvalFailed(_) => "EVAL_FAILED",
            DebugError::EvalTimeout => "EVAL_TIMEOUT",
            DebugError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    /// The message surfaced in a DAP error response.
    pub fn client_message(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}
