//! Remote debugger server for embedded script engines.
//!
//! The engine embeds a [`debugger::DebugServer`] and drives it cooperatively:
//! every bytecode dispatch calls [`debugger::DebugServer::tick`], parse and
//! exception events are reported through the `on_*` operations, and the
//! server talks to a single debugger client over a simplified websocket
//! dialect on one TCP session. There are no threads and no locks inside the
//! crate; blocking states (breakpoint, source wait) are poll-and-sleep loops
//! on the engine's own thread.

pub mod debugger;

pub use debugger::error::Error;
pub use debugger::{DebugServer, EngineHook};
