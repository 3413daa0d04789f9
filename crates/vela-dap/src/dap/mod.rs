//! Debug Adapter Protocol plumbing: message shapes and the Content-Length
//! framed codec.

pub mod codec;
pub mod messages;

pub use codec::{DapError, DapReader, DapWriter};
pub use messages::{make_event, make_response, Event, Request, Response};
