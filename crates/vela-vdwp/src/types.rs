//! Shared VWP wire types.

use thiserror::Error;

pub type ThreadId = u64;
pub type FrameId = u64;
pub type ObjectId = u64;
pub type TypeDesc = u64;
pub type RequestId = i32;

pub type Result<T> = std::result::Result<T, VwpError>;

/// VM-side error codes carried in reply packets.
pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 11;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_FRAME: u16 = 21;
pub const ERROR_INVALID_EVENT_REQUEST: u16 = 30;
pub const ERROR_INVALID_FUNCTION: u16 = 40;
pub const ERROR_INVALID_TYPE: u16 = 41;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;

/// Event kinds used in `EventRequest.Set` and composite event packets.
pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_EXCEPTION: u8 = 4;
pub const EVENT_KIND_FUNCTION_ENTRY: u8 = 8;
pub const EVENT_KIND_THREAD_DEATH: u8 = 16;
pub const EVENT_KIND_VM_EXIT: u8 = 32;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

/// Runtime tag attached to object references on the wire.
///
/// The tag reflects the *concrete* runtime shape of the value, which may be
/// narrower than its declared Vela type (unions, `any`). Tags the client does
/// not recognize are preserved as [`RefTag::Unrecognized`] so decoding never
/// fails on a newer VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefTag {
    Record,
    Map,
    List,
    Tuple,
    Error,
    Opaque,
    Unrecognized(u8),
}

impl RefTag {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            1 => Self::Record,
            2 => Self::Map,
            3 => Self::List,
            4 => Self::Tuple,
            5 => Self::Error,
            6 => Self::Opaque,
            other => Self::Unrecognized(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Record => 1,
            Self::Map => 2,
            Self::List => 3,
            Self::Tuple => 4,
            Self::Error => 5,
            Self::Opaque => 6,
            Self::Unrecognized(raw) => raw,
        }
    }
}

/// A Vela runtime value as transported over VWP.
///
/// Primitives are carried inline; everything else is an object reference plus
/// its runtime tag and type descriptor. References are only meaningful while
/// the owning thread stays suspended.
#[derive(Debug, Clone, PartialEq)]
pub enum VwpValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Byte(u8),
    Str(String),
    Ref {
        id: ObjectId,
        tag: RefTag,
        type_desc: TypeDesc,
    },
}

impl VwpValue {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Ref { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// The Vela VM's canonical textual rendering of a float.
///
/// Variable displays must match the runtime's own conversion exactly, so both
/// the translator in `vela-dap` and the mock VM go through this one function.
/// Integral values keep a trailing `.0` (`1.0`, not `1`).
pub fn canonical_float(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == value.trunc() && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// A code location inside the debuggee, in runtime terms.
///
/// Mapping back to file/line goes through the metadata commands (see
/// `VwpClient::function_info` / `line_table`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub function_id: u64,
    pub code_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

/// A named slot (local, global, or object field) plus its value.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub name: String,
    /// Source-level declared type, when the VM has debug metadata for it.
    pub declared_type: Option<String>,
    pub value: VwpValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub type_desc: TypeDesc,
    pub type_name: String,
    pub tag: RefTag,
    /// Field/element/entry count, depending on the tag.
    pub size: u32,
    /// Optional short display computed by the VM (e.g. an error's message).
    pub brief: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub source_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    /// Declared fields in declaration order.
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

impl StepDepth {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Into => 0,
            Self::Over => 1,
            Self::Out => 2,
        }
    }

    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Into),
            1 => Some(Self::Over),
            2 => Some(Self::Out),
            _ => None,
        }
    }
}

/// Result of `Eval.Evaluate`.
///
/// Evaluation failures are ordinary outcomes (the expression was bad, not the
/// connection), so they carry the runtime's message instead of a bare error
/// code.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    Value(VwpValue),
    Error(String),
}

/// Asynchronous event delivered by the VM.
#[derive(Debug, Clone)]
pub enum VwpEvent {
    Breakpoint {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
    },
    FunctionEntry {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
    },
    SingleStep {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: RequestId,
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

#[derive(Debug, Error)]
pub enum VwpError {
    #[error("VWP protocol error: {0}")]
    Protocol(String),
    #[error("VWP command failed with VM error code {0}")]
    VmError(u16),
    #[error("VWP command timed out")]
    Timeout,
    #[error("VWP connection closed")]
    ConnectionClosed,
    #[error("VWP operation cancelled")]
    Cancelled,
    #[error("VWP handshake failed")]
    HandshakeFailed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("VWP string was not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}
