//! Expression evaluation against a suspended frame.
//!
//! Evaluation runs in the VM, bounded by the configured timeout. A timeout or
//! runtime failure is an *evaluation* error scoped to the one request (or the
//! one breakpoint condition); it never terminates the session.

use std::time::Duration;

use vela_vdwp::{EvalOutcome, FrameId, ThreadId, VwpClient, VwpError, VwpValue};

use crate::error::{DebugError, DebugResult};

pub async fn evaluate(
    client: &VwpClient,
    thread: ThreadId,
    frame: FrameId,
    expression: &str,
    timeout: Duration,
) -> DebugResult<VwpValue> {
    let outcome = tokio::time::timeout(timeout, client.evaluate(thread, frame, expression))
        .await
        .map_err(|_| DebugError::EvalTimeout)?;

    match outcome {
        Ok(EvalOutcome::Value(value)) => Ok(value),
        Ok(EvalOutcome::Error(message)) => Err(DebugError::EvalFailed(message)),
        Err(VwpError::Timeout) => Err(DebugError::EvalTimeout),
        Err(err) => Err(DebugError::EvalFailed(err.to_string())),
    }
}

/// Truthiness of a condition result.
///
/// Only an actual `Bool` decides; anything else is a broken condition and is
/// reported as such so the breakpoint engine can apply its fail-safe policy.
pub fn condition_holds(value: &VwpValue) -> Result<bool, String> {
    match value {
        VwpValue::Bool(v) => Ok(*v),
        other => Err(format!("condition evaluated to a non-boolean: {other:?}")),
    }
}
