pub mod breakpoints;
mod dispatch;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod session;
pub mod transport;

use crate::debugger::breakpoints::{BreakpointRegistry, FreeQueue};
use crate::debugger::error::Error;
use crate::debugger::protocol::{
    ByteCodeCp, DebuggerConfig, EvalKind, OutMessage, OutputSubtype,
};
use crate::debugger::session::Session;
use crate::debugger::transport::Transport;

/// What the engine should do after a safepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmAction {
    /// Keep executing.
    Continue,
    /// Throw the given value as an exception in the current frame.
    Throw(Vec<u8>),
}

/// What the engine should do with an exception it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionAction {
    /// No pause happened; unwind with the original exception.
    Proceed,
    /// The client observed the pause; unwind with the original exception.
    Stopped,
    /// The client injected a replacement; throw this value instead.
    Throw(Vec<u8>),
}

/// Outcome of a client source wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// A source arrived and the callback ran.
    Received,
    /// The client has no more sources to offer.
    End,
    /// The client asked for a full context reinitialization.
    Reset,
    /// The connection is gone.
    Failed,
}

/// One call frame of a backtrace reply, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacktraceFrame {
    pub byte_code: ByteCodeCp,
    /// Offset of the last executed breakpoint location in the frame.
    pub offset: u32,
}

/// Memory counters reported on client request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    pub allocated_bytes: u32,
    pub byte_code_bytes: u32,
    pub string_bytes: u32,
    pub object_bytes: u32,
    pub property_bytes: u32,
}

/// Result of evaluating a client expression in the paused context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// String form of the result value.
    Ok(Vec<u8>),
    /// String form of the raised error.
    Error(Vec<u8>),
}

/// Services the host engine provides to the debugger.
///
/// All calls happen on the engine's own thread, interleaved with (never
/// parallel to) bytecode execution, while the engine sits inside one of the
/// server's operations.
pub trait EngineHook {
    /// Evaluate an expression in the currently paused context.
    fn eval(&mut self, kind: EvalKind, source: &[u8]) -> anyhow::Result<EvalOutcome>;

    /// Collect up to `max_depth` call frames, newest first. 0 = unlimited.
    fn backtrace(&mut self, max_depth: u32) -> Vec<BacktraceFrame>;

    /// Current call stack depth, used to scope step-over and step-out.
    fn frame_depth(&mut self) -> u32;

    /// Current memory counters.
    fn memstats(&mut self) -> MemStats;

    /// Release a bytecode unit the client no longer references.
    fn free_byte_code(&mut self, cp: ByteCodeCp);
}

/// Everything the client needs to know about one freshly parsed function.
#[derive(Debug, Clone, Copy)]
pub struct ParsedFunction<'a> {
    pub source: &'a [u8],
    pub source_name: &'a [u8],
    pub function_name: &'a [u8],
    pub line: u32,
    pub column: u32,
    /// Line offsets that can carry a breakpoint.
    pub breakpoint_lines: &'a [u32],
    /// Bytecode offsets matching `breakpoint_lines` pairwise.
    pub breakpoint_offsets: &'a [u32],
    pub byte_code: ByteCodeCp,
}

/// Primary operating mode. Auxiliary conditions (stop request, ignore,
/// pending throw) live next to it as plain flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecMode {
    /// Script runs; only the always-accepted command subset is honored.
    Run,
    /// Paused at a breakpoint or exception; inspection commands accepted.
    Breakpoint,
    /// Paused after a parse, waiting for the client to release.
    ParserWait,
    /// Waiting for the client to inject source to execute.
    ClientSource,
}

/// Scope of a pending stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepScope {
    /// Stop at the next opportunity regardless of the call stack.
    Any,
    /// Step-over: skip safepoints in frames deeper than the recorded depth.
    SameOrShallower(u32),
    /// Step-out: skip until the recorded frame has returned.
    Shallower(u32),
}

/// In-flight inbound fragmented transfer.
#[derive(Debug)]
struct Transfer {
    kind: TransferKind,
    total: usize,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Eval,
    Throw,
    ClientSource,
}

/// Terminal events of the client source wait loop.
#[derive(Debug)]
enum SourceEvent {
    Received(Vec<u8>),
    NoMore,
    Reset,
}

/// Debugger server endpoint embedded into a script engine.
///
/// One instance serves one client connection at a time; the engine drives it
/// cooperatively through [`DebugServer::tick`] and the `on_*` notifications.
pub struct DebugServer<T: Transport, H: EngineHook> {
    session: Session<T>,
    hooks: H,
    config: DebuggerConfig,
    mode: ExecMode,
    vm_stop: bool,
    vm_ignore: bool,
    ignore_exception: bool,
    parser_wait: bool,
    context_reset: bool,
    pending_throw: Option<Vec<u8>>,
    step_scope: StepScope,
    breakpoints: BreakpointRegistry,
    free_queue: FreeQueue,
    transfer: Option<Transfer>,
    source_event: Option<SourceEvent>,
    message_delay: u32,
}

impl<T: Transport, H: EngineHook> DebugServer<T, H> {
    pub fn new(transport: T, hooks: H) -> Self {
        Self::with_config(transport, hooks, DebuggerConfig::default())
    }

    pub fn with_config(transport: T, hooks: H, config: DebuggerConfig) -> Self {
        Self {
            session: Session::new(transport),
            hooks,
            config,
            mode: ExecMode::Run,
            vm_stop: false,
            vm_ignore: false,
            ignore_exception: false,
            parser_wait: false,
            context_reset: false,
            pending_throw: None,
            step_scope: StepScope::Any,
            breakpoints: BreakpointRegistry::default(),
            free_queue: FreeQueue::default(),
            transfer: None,
            source_event: None,
            message_delay: 0,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Wait for a client on the given port, run the handshake and send the
    /// configuration message. On success the engine is expected to pause at
    /// the first safepoint.
    pub fn init(&mut self, port: u16) -> Result<(), Error> {
        self.session.accept(port)?;

        self.mode = ExecMode::Run;
        self.vm_ignore = false;
        self.ignore_exception = false;
        self.parser_wait = false;
        self.context_reset = false;
        self.pending_throw = None;
        self.transfer = None;
        self.source_event = None;

        let result = self.session.send_configuration(self.config.cpointer_size);
        if !self.guard(result)? {
            return Err(Error::NotConnected);
        }

        self.vm_stop = true;
        self.step_scope = StepScope::Any;
        self.message_delay = 0;
        log::debug!(target: "debugger", "debugger client attached");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Request a pause at the next safepoint.
    pub fn stop(&mut self) {
        self.vm_stop = true;
        self.step_scope = StepScope::Any;
    }

    /// Withdraw a pending pause request.
    pub fn continue_run(&mut self) {
        self.vm_stop = false;
    }

    /// Enable or disable pausing altogether. While disabled the engine runs
    /// blind over every breakpoint.
    pub fn stop_at_breakpoint(&mut self, enable: bool) {
        self.vm_ignore = !enable;
    }

    /// True once the client has requested a full engine reinitialization.
    pub fn context_reset_requested(&self) -> bool {
        self.context_reset
    }

    /// Override framing overheads for alternate transports.
    pub fn set_transmit_sizes(
        &mut self,
        send_header: usize,
        max_send: usize,
        recv_header: usize,
        max_recv: usize,
    ) {
        self.session
            .set_transmit_sizes(send_header, max_send, recv_header, max_recv);
    }

    /// Safepoint entry, called once per bytecode dispatch. Polls the socket
    /// every few calls, pauses on a stop request or an active breakpoint and
    /// only returns once the client resumes execution.
    pub fn tick(&mut self, byte_code: ByteCodeCp, offset: u32) -> Result<VmAction, Error> {
        if !self.is_connected() {
            return Ok(VmAction::Continue);
        }

        if self.message_delay == 0 {
            self.message_delay = self.config.message_frequency;
            if let Err(e) = self.poll_once() {
                self.recover(e)?;
            }
        } else {
            self.message_delay -= 1;
        }

        if !self.is_connected() || self.vm_ignore {
            return Ok(VmAction::Continue);
        }

        let stop_requested = self.vm_stop && self.scope_allows();
        if stop_requested || self.breakpoints.is_active(byte_code, offset) {
            self.pause(OutMessage::BreakpointHit, byte_code, offset)?;
            if let Some(message) = self.pending_throw.take() {
                return Ok(VmAction::Throw(message));
            }
        }
        Ok(VmAction::Continue)
    }

    /// Report a thrown exception about to unwind. The pause behaves exactly
    /// like a breakpoint pause, so a throw injected by the client while
    /// stopped here replaces the original exception.
    pub fn on_exception(
        &mut self,
        byte_code: ByteCodeCp,
        offset: u32,
        message: &[u8],
    ) -> Result<ExceptionAction, Error> {
        if !self.is_connected() || self.vm_ignore || self.ignore_exception {
            return Ok(ExceptionAction::Proceed);
        }

        let result = self.session.send_string(
            OutMessage::ExceptionStr,
            OutMessage::ExceptionStrEnd,
            None,
            message,
        );
        if !self.guard(result)? {
            return Ok(ExceptionAction::Proceed);
        }

        self.pause(OutMessage::ExceptionHit, byte_code, offset)?;
        if let Some(message) = self.pending_throw.take() {
            return Ok(ExceptionAction::Throw(message));
        }
        Ok(ExceptionAction::Stopped)
    }

    /// Publish a freshly parsed function: its source, names, position, the
    /// possible breakpoint locations and the bytecode handle.
    pub fn on_parse_function(&mut self, function: &ParsedFunction<'_>) -> Result<(), Error> {
        self.breakpoints
            .register_unit(function.byte_code, function.breakpoint_offsets);

        if !self.is_connected() {
            return Ok(());
        }

        let result = self
            .session
            .send_string(
                OutMessage::SourceCode,
                OutMessage::SourceCodeEnd,
                None,
                function.source,
            )
            .and_then(|()| {
                self.session.send_string(
                    OutMessage::SourceCodeName,
                    OutMessage::SourceCodeNameEnd,
                    None,
                    function.source_name,
                )
            })
            .and_then(|()| {
                self.session.send_string(
                    OutMessage::FunctionName,
                    OutMessage::FunctionNameEnd,
                    None,
                    function.function_name,
                )
            })
            .and_then(|()| self.session.send_parse_function(function.line, function.column))
            .and_then(|()| {
                self.session
                    .send_u32_list(OutMessage::BreakpointList, function.breakpoint_lines)
            })
            .and_then(|()| {
                self.session.send_u32_list(
                    OutMessage::BreakpointOffsetList,
                    function.breakpoint_offsets,
                )
            })
            .and_then(|()| {
                self.session.send_function_cp(
                    OutMessage::ByteCodeCp,
                    function.byte_code,
                    self.config.cpointer_size,
                )
            });
        self.guard(result).map(|_| ())
    }

    /// A whole parse finished. If the client asked to wait after parsing,
    /// block here until it sends the resume command.
    pub fn on_parse_completed(&mut self) -> Result<(), Error> {
        if !self.is_connected() || !self.parser_wait {
            return Ok(());
        }
        let result = self.session.send_type(OutMessage::WaitingAfterParse);
        if !self.guard(result)? {
            return Ok(());
        }
        self.mode = ExecMode::ParserWait;
        self.poll_blocking(|server| server.mode == ExecMode::ParserWait)
    }

    /// A parse failed. The human-readable message travels separately through
    /// [`DebugServer::send_output`].
    pub fn on_parse_error(&mut self) -> Result<(), Error> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.session.send_type(OutMessage::ParseError);
        self.guard(result).map(|_| ())
    }

    /// The engine wants to drop a compiled unit. Release is deferred until
    /// the client acknowledges that it no longer holds the handle.
    pub fn on_byte_code_free(&mut self, cp: ByteCodeCp) -> Result<(), Error> {
        self.breakpoints.remove_unit(cp);

        if !self.is_connected() {
            self.hooks.free_byte_code(cp);
            return Ok(());
        }

        self.free_queue.push(cp);
        let result =
            self.session
                .send_function_cp(OutMessage::ReleaseByteCodeCp, cp, self.config.cpointer_size);
        self.guard(result).map(|_| ())
    }

    /// Ask the client for a source to execute and block until one arrives.
    /// The callback receives the resource name and the source body; its
    /// error aborts the engine (fatal).
    pub fn wait_for_client_source<F>(&mut self, mut on_source: F) -> Result<SourceStatus, Error>
    where
        F: FnMut(&str, &[u8]) -> anyhow::Result<()>,
    {
        if !self.is_connected() {
            return Ok(SourceStatus::Failed);
        }
        let result = self.session.send_type(OutMessage::WaitForSource);
        if !self.guard(result)? {
            return Ok(SourceStatus::Failed);
        }

        self.mode = ExecMode::ClientSource;
        self.poll_blocking(|server| {
            server.mode == ExecMode::ClientSource && server.source_event.is_none()
        })?;

        if !self.is_connected() {
            return Ok(SourceStatus::Failed);
        }
        self.mode = ExecMode::Run;

        match self.source_event.take() {
            Some(SourceEvent::Received(buf)) => {
                let Some(nul) = buf.iter().position(|&b| b == 0) else {
                    self.recover(Error::InvalidMessage("client source without resource name"))?;
                    return Ok(SourceStatus::Failed);
                };
                let name = match std::str::from_utf8(&buf[..nul]) {
                    Ok(name) => name,
                    Err(e) => {
                        self.recover(e.into())?;
                        return Ok(SourceStatus::Failed);
                    }
                };
                on_source(name, &buf[nul + 1..]).map_err(Error::Hook)?;
                Ok(SourceStatus::Received)
            }
            Some(SourceEvent::NoMore) => Ok(SourceStatus::End),
            Some(SourceEvent::Reset) => {
                self.context_reset = true;
                Ok(SourceStatus::Reset)
            }
            None => Ok(SourceStatus::Failed),
        }
    }

    /// Forward program output to the client.
    pub fn send_output(&mut self, data: &[u8], subtype: OutputSubtype) -> Result<(), Error> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.session.send_string(
            OutMessage::OutputResult,
            OutMessage::OutputResultEnd,
            Some(subtype as u8),
            data,
        );
        self.guard(result).map(|_| ())
    }

    /// Pause execution: report the hit, switch to breakpoint mode and poll
    /// until a resume command arrives.
    fn pause(&mut self, hit: OutMessage, byte_code: ByteCodeCp, offset: u32) -> Result<(), Error> {
        self.vm_stop = false;
        self.step_scope = StepScope::Any;
        self.mode = ExecMode::Breakpoint;

        let mut body = Vec::with_capacity(8);
        byte_code.write(self.config.cpointer_size, &mut body);
        body.extend_from_slice(&offset.to_ne_bytes());
        let result = self.session.send_data(hit, &body);
        if !self.guard(result)? {
            return Ok(());
        }
        log::debug!(target: "debugger", "execution paused at {byte_code}:{offset}");

        self.poll_blocking(|server| server.mode == ExecMode::Breakpoint)
    }

    fn scope_allows(&mut self) -> bool {
        match self.step_scope {
            StepScope::Any => true,
            StepScope::SameOrShallower(depth) => self.hooks.frame_depth() <= depth,
            StepScope::Shallower(depth) => self.hooks.frame_depth() < depth,
        }
    }

    /// Downgrade a session failure: log it, tear the connection down and let
    /// the engine run on. Hook failures stay fatal and propagate.
    fn recover(&mut self, e: Error) -> Result<(), Error> {
        if e.is_fatal() {
            return Err(e);
        }
        match e {
            Error::ConnectionClosed => log::debug!(target: "debugger", "{e}"),
            _ => log::warn!(target: "debugger", "{e}"),
        }
        self.teardown();
        Ok(())
    }

    /// Run a fallible send, recovering from session failures. Returns
    /// whether the send went through.
    fn guard(&mut self, result: Result<(), Error>) -> Result<bool, Error> {
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.recover(e)?;
                Ok(false)
            }
        }
    }

    /// Drop the session and everything scoped to it. The engine drains the
    /// rest of the script without pausing.
    fn teardown(&mut self) {
        self.session.close();
        self.mode = ExecMode::Run;
        self.vm_stop = false;
        self.vm_ignore = true;
        self.parser_wait = false;
        self.pending_throw = None;
        self.step_scope = StepScope::Any;
        self.transfer = None;
        self.source_event = None;

        let parked: Vec<_> = self.free_queue.drain().collect();
        for cp in parked {
            self.breakpoints.remove_unit(cp);
            self.hooks.free_byte_code(cp);
        }
    }
}
