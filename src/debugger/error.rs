use crate::debugger::protocol::ByteCodeCp;
use std::str::Utf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- i/o errors ------------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("debugger client connection closed")]
    ConnectionClosed,
    #[error("debugger client is not connected")]
    NotConnected,

    // --------------------------------- handshake errors ------------------------------------------
    #[error("handshake buffer too small")]
    HandshakeOverflow,
    #[error("invalid handshake format")]
    InvalidHandshake,
    #[error("Sec-WebSocket-Key not found")]
    WebSocketKeyMissing,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("unsupported websocket message")]
    UnsupportedWebSocketMessage,
    #[error("unsupported websocket opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("unexpected message type {0}")]
    UnexpectedMessage(u8),
    #[error("malformed message: {0}")]
    InvalidMessage(&'static str),
    #[error("message not allowed in the current mode")]
    NotAllowedInMode,
    #[error("unknown breakpoint location {0}:{1}")]
    UnknownBreakpoint(ByteCodeCp, u32),
    #[error("unknown bytecode unit {0}")]
    UnknownByteCode(ByteCodeCp),
    #[error("message transfer already in progress")]
    TransferInProgress,
    #[error("announced transfer size {0} over limit")]
    TransferTooLarge(u32),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),

    // --------------------------------- engine hook errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to the host engine - a failed session is survivable
    /// (execution resumes with breakpoints ignored), a failed hook is not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) => false,
            Error::ConnectionClosed => false,
            Error::NotConnected => false,
            Error::HandshakeOverflow => false,
            Error::InvalidHandshake => false,
            Error::WebSocketKeyMissing => false,
            Error::UnsupportedWebSocketMessage => false,
            Error::UnsupportedOpcode(_) => false,
            Error::UnexpectedMessage(_) => false,
            Error::InvalidMessage(_) => false,
            Error::NotAllowedInMode => false,
            Error::UnknownBreakpoint(_, _) => false,
            Error::UnknownByteCode(_) => false,
            Error::TransferInProgress => false,
            Error::TransferTooLarge(_) => false,
            Error::Utf8(_) => false,

            // currently fatal errors
            Error::Hook(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
