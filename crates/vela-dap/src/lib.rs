//! Debug adapter for the Vela VM.
//!
//! Speaks DAP to an editor over stdio and VWP (via `vela-vdwp`) to a running
//! VM. The interesting parts are the session state machine in [`session`],
//! the breakpoint engine in [`breakpoints`], and the value translation
//! subsystem in [`value`].

pub mod breakpoints;
pub mod bridge;
pub mod config;
pub mod context;
pub mod dap;
pub mod error;
pub mod eval;
pub mod ext;
pub mod refs;
pub mod server;
pub mod session;
pub mod value;

pub use config::DapConfig;
pub use error::{DebugError, DebugResult};
pub use session::{DebugSession, SessionState};
