//! Wire-level constants and message type codes.
//!
//! The protocol is a simplified RFC-6455 dialect: binary frames only, one
//! byte of payload length, client-to-server masking. Every payload starts
//! with a one-byte message type; outgoing and incoming codes are independent
//! namespaces, each starting at 1. Multi-byte numeric fields travel in the
//! host engine's native byte order; the initial configuration message tells
//! the client which order that is.

use std::time::Duration;

/// Version of the debugger wire protocol.
pub const PROTOCOL_VERSION: u8 = 2;

/// Bytecode dispatches between two socket polls while the engine runs.
pub const MESSAGE_FREQUENCY: u32 = 5;

/// Shared size of the send and receive buffers. One frame, header included,
/// must fit.
pub const MAX_BUFFER_SIZE: usize = 128;

// Limited resources on the engine side keep the buffer small; the one-byte
// websocket length caps it from above.
const _: () = assert!(MAX_BUFFER_SIZE >= 64 && MAX_BUFFER_SIZE <= 256);

/// Default sleep between poll attempts while execution is paused.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default cap for client-driven transfer buffers (eval, injected source).
pub const DEFAULT_MAX_TRANSFER_SIZE: u32 = 1024 * 1024;

/// Messages sent by the server to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutMessage {
    /// Handshake follow-up, sent exactly once per connection.
    Configuration = 1,
    ParseError = 2,
    ByteCodeCp = 3,
    ParseFunction = 4,
    /// Line offsets carrying possible breakpoints, repeated until exhausted.
    BreakpointList = 5,
    /// Bytecode offsets matching the line list, repeated until exhausted.
    BreakpointOffsetList = 6,
    SourceCode = 7,
    SourceCodeEnd = 8,
    SourceCodeName = 9,
    SourceCodeNameEnd = 10,
    FunctionName = 11,
    FunctionNameEnd = 12,
    WaitingAfterParse = 13,
    ReleaseByteCodeCp = 14,
    MemstatsReceive = 15,
    BreakpointHit = 16,
    ExceptionHit = 17,
    ExceptionStr = 18,
    ExceptionStrEnd = 19,
    Backtrace = 20,
    BacktraceEnd = 21,
    EvalResult = 22,
    EvalResultEnd = 23,
    WaitForSource = 24,
    OutputResult = 25,
    OutputResultEnd = 26,
}

/// Messages sent by the client to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InMessage {
    FreeByteCodeCp = 1,
    UpdateBreakpoint = 2,
    ExceptionConfig = 3,
    ParserConfig = 4,
    Memstats = 5,
    Stop = 6,
    ParserResume = 7,
    ClientSource = 8,
    ClientSourcePart = 9,
    NoMoreSources = 10,
    ContextReset = 11,
    Continue = 12,
    Step = 13,
    Next = 14,
    Finish = 15,
    GetBacktrace = 16,
    Eval = 17,
    EvalPart = 18,
    Throw = 19,
    ThrowPart = 20,
}

impl InMessage {
    /// Parse a raw type byte, `None` for codes outside the protocol.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::FreeByteCodeCp),
            2 => Some(Self::UpdateBreakpoint),
            3 => Some(Self::ExceptionConfig),
            4 => Some(Self::ParserConfig),
            5 => Some(Self::Memstats),
            6 => Some(Self::Stop),
            7 => Some(Self::ParserResume),
            8 => Some(Self::ClientSource),
            9 => Some(Self::ClientSourcePart),
            10 => Some(Self::NoMoreSources),
            11 => Some(Self::ContextReset),
            12 => Some(Self::Continue),
            13 => Some(Self::Step),
            14 => Some(Self::Next),
            15 => Some(Self::Finish),
            16 => Some(Self::GetBacktrace),
            17 => Some(Self::Eval),
            18 => Some(Self::EvalPart),
            19 => Some(Self::Throw),
            20 => Some(Self::ThrowPart),
            _ => None,
        }
    }
}

/// Subtype prefix of an eval result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EvalSubtype {
    Ok = 1,
    Error = 2,
}

/// Subtype prefix of a forwarded program output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputSubtype {
    Ok = 1,
    Error = 2,
    Warning = 3,
    Debug = 4,
    Trace = 5,
}

/// What the client asked an eval request to do with the expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalKind {
    /// Evaluate and report the result value.
    Evaluate,
    /// Evaluate and throw the result in the paused context.
    Throw,
}

impl EvalKind {
    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Evaluate),
            1 => Some(Self::Throw),
            _ => None,
        }
    }
}

/// Width of the compressed bytecode pointer on the wire, advertised to the
/// client in the configuration message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpSize {
    Two,
    Four,
}

impl CpSize {
    pub fn byte_len(self) -> usize {
        match self {
            CpSize::Two => 2,
            CpSize::Four => 4,
        }
    }
}

/// Stable identifier of a compiled bytecode unit. The server never
/// dereferences it; it only travels the wire and keys the breakpoint maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteCodeCp(pub u32);

impl std::fmt::Display for ByteCodeCp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl ByteCodeCp {
    /// Native-order wire bytes at the configured width.
    pub(crate) fn write(self, size: CpSize, out: &mut Vec<u8>) {
        match size {
            CpSize::Two => out.extend_from_slice(&(self.0 as u16).to_ne_bytes()),
            CpSize::Four => out.extend_from_slice(&self.0.to_ne_bytes()),
        }
    }

    pub(crate) fn read(size: CpSize, bytes: &[u8]) -> Option<Self> {
        match size {
            CpSize::Two => Some(ByteCodeCp(u16::from_ne_bytes(
                bytes.get(..2)?.try_into().ok()?,
            ) as u32)),
            CpSize::Four => Some(ByteCodeCp(u32::from_ne_bytes(
                bytes.get(..4)?.try_into().ok()?,
            ))),
        }
    }
}

/// Runtime knobs of a server instance.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// Sleep between poll attempts while paused.
    pub poll_interval: Duration,
    /// Bytecode dispatches between two polls while running.
    pub message_frequency: u32,
    /// Wire width of compressed bytecode pointers.
    pub cpointer_size: CpSize,
    /// Upper bound on client-announced transfer sizes.
    pub max_transfer_size: u32,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            message_frequency: MESSAGE_FREQUENCY,
            cpointer_size: CpSize::Two,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }
}
