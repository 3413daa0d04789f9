//! Vela Debug Wire Protocol (VWP) client.
//!
//! VWP is the binary request/reply/event protocol spoken by a Vela VM started
//! with debugging enabled. `vela-dap` consumes this crate to suspend and
//! resume threads, walk stacks, read the object graph, evaluate expressions,
//! and subscribe to asynchronous stop events.
//!
//! The client is async (`tokio`) and cancellation-aware: every command is
//! bounded by a reply timeout, and the whole connection can be torn down
//! through [`VwpClient::shutdown`] or by the VM closing the socket.

mod client;
mod codec;
pub mod types;

pub use client::{EventModifier, VwpClient, VwpClientConfig};
pub use types::{
    canonical_float, EvalOutcome, FrameId, FrameInfo, FunctionInfo, LineTableEntry, Location,
    NamedValue, ObjectId, ObjectSummary, RefTag, RequestId, StepDepth, ThreadId, TypeDesc,
    TypeInfo, VwpError, VwpEvent, VwpValue, ERROR_INVALID_FRAME, ERROR_INVALID_OBJECT,
    ERROR_INVALID_THREAD, EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION, EVENT_KIND_FUNCTION_ENTRY,
    EVENT_KIND_SINGLE_STEP, EVENT_KIND_THREAD_DEATH, EVENT_KIND_VM_EXIT, SUSPEND_POLICY_ALL,
    SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE,
};

// The mock VM is only needed for tests and downstream integration suites.
// Compile it for vela-vdwp's own unit tests unconditionally (via `cfg(test)`),
// while keeping it behind the `wire-test-support` feature for normal builds
// and for downstream crates.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;
