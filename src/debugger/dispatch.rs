//! Inbound message dispatcher.
//!
//! Messages are handled strictly in arrival order; a handler finishes,
//! including any reply stream, before the next frame is decoded, so outbound
//! streams are never interleaved on the wire. Which types are honored
//! depends on the current operating mode; anything off the table kills the
//! connection.

use crate::debugger::error::Error;
use crate::debugger::protocol::{
    ByteCodeCp, EvalKind, EvalSubtype, InMessage, OutMessage, MAX_BUFFER_SIZE,
};
use crate::debugger::transport::Transport;
use crate::debugger::{
    DebugServer, EngineHook, EvalOutcome, ExecMode, SourceEvent, StepScope, Transfer, TransferKind,
};

impl TransferKind {
    /// The only message type accepted while this transfer is open.
    fn part_message(self) -> InMessage {
        match self {
            TransferKind::Eval => InMessage::EvalPart,
            TransferKind::Throw => InMessage::ThrowPart,
            TransferKind::ClientSource => InMessage::ClientSourcePart,
        }
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32, Error> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::InvalidMessage("truncated 32-bit field"))?;
    Ok(u32::from_ne_bytes(arr))
}

fn read_flag(body: &[u8]) -> Result<bool, Error> {
    match body {
        [flag] => Ok(*flag != 0),
        _ => Err(Error::InvalidMessage("expected a single flag byte")),
    }
}

fn expect_empty(body: &[u8]) -> Result<(), Error> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidMessage("unexpected message body"))
    }
}

impl<T: Transport, H: EngineHook> DebugServer<T, H> {
    /// One receive attempt, then every frame that completed. Returns whether
    /// any frame was processed. Errors are raw here; callers decide between
    /// recovery and propagation.
    pub(super) fn poll_once(&mut self) -> Result<bool, Error> {
        let mut progress = false;
        loop {
            let mut payload = [0u8; MAX_BUFFER_SIZE];
            match self.session.recv_frame(&mut payload)? {
                None => return Ok(progress),
                Some(len) => {
                    progress = true;
                    self.process_message(&payload[..len])?;
                }
            }
        }
    }

    /// Poll-and-sleep until `cond` turns false or the connection dies.
    /// Session failures are recovered in place; only hook failures escape.
    pub(super) fn poll_blocking<C>(&mut self, cond: C) -> Result<(), Error>
    where
        C: Fn(&Self) -> bool,
    {
        while self.session.is_connected() && cond(self) {
            match self.poll_once() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(self.config.poll_interval),
                Err(e) => self.recover(e)?,
            }
        }
        Ok(())
    }

    fn process_message(&mut self, payload: &[u8]) -> Result<(), Error> {
        let type_byte = *payload
            .first()
            .ok_or(Error::InvalidMessage("empty payload"))?;
        let message =
            InMessage::from_u8(type_byte).ok_or(Error::UnexpectedMessage(type_byte))?;

        // an open transfer admits nothing but its own continuation
        if let Some(transfer) = &self.transfer {
            if message != transfer.kind.part_message() {
                return Err(Error::UnexpectedMessage(type_byte));
            }
        }

        if !accepted_in_mode(self.mode, message) {
            return Err(Error::NotAllowedInMode);
        }

        let body = &payload[1..];
        match message {
            InMessage::FreeByteCodeCp => self.handle_free_byte_code(body),
            InMessage::UpdateBreakpoint => self.handle_update_breakpoint(body),
            InMessage::ExceptionConfig => {
                self.ignore_exception = !read_flag(body)?;
                Ok(())
            }
            InMessage::ParserConfig => {
                self.parser_wait = read_flag(body)?;
                Ok(())
            }
            InMessage::Memstats => {
                expect_empty(body)?;
                self.handle_memstats()
            }
            InMessage::Stop => {
                expect_empty(body)?;
                self.vm_stop = true;
                self.step_scope = StepScope::Any;
                Ok(())
            }
            InMessage::ParserResume => {
                expect_empty(body)?;
                self.mode = ExecMode::Run;
                Ok(())
            }
            InMessage::ClientSource => self.start_transfer(TransferKind::ClientSource, body),
            InMessage::ClientSourcePart => self.continue_transfer(body),
            InMessage::NoMoreSources => {
                expect_empty(body)?;
                self.source_event = Some(SourceEvent::NoMore);
                Ok(())
            }
            InMessage::ContextReset => {
                expect_empty(body)?;
                self.source_event = Some(SourceEvent::Reset);
                Ok(())
            }
            InMessage::Continue => {
                expect_empty(body)?;
                self.resume(false, StepScope::Any);
                Ok(())
            }
            InMessage::Step => {
                expect_empty(body)?;
                self.resume(true, StepScope::Any);
                Ok(())
            }
            InMessage::Next => {
                expect_empty(body)?;
                let depth = self.hooks.frame_depth();
                self.resume(true, StepScope::SameOrShallower(depth));
                Ok(())
            }
            InMessage::Finish => {
                expect_empty(body)?;
                let depth = self.hooks.frame_depth();
                self.resume(true, StepScope::Shallower(depth));
                Ok(())
            }
            InMessage::GetBacktrace => self.handle_get_backtrace(body),
            InMessage::Eval => self.start_transfer(TransferKind::Eval, body),
            InMessage::EvalPart => self.continue_transfer(body),
            InMessage::Throw => self.start_transfer(TransferKind::Throw, body),
            InMessage::ThrowPart => self.continue_transfer(body),
        }
    }

    /// Leave breakpoint mode with the given pending stop request.
    fn resume(&mut self, vm_stop: bool, scope: StepScope) {
        self.mode = ExecMode::Run;
        self.vm_stop = vm_stop;
        self.step_scope = scope;
    }

    fn handle_free_byte_code(&mut self, body: &[u8]) -> Result<(), Error> {
        if body.len() != self.config.cpointer_size.byte_len() {
            return Err(Error::InvalidMessage("bad bytecode pointer size"));
        }
        let cp = ByteCodeCp::read(self.config.cpointer_size, body)
            .ok_or(Error::InvalidMessage("truncated bytecode pointer"))?;

        self.free_queue.acknowledge(cp)?;
        self.hooks.free_byte_code(cp);
        Ok(())
    }

    fn handle_update_breakpoint(&mut self, body: &[u8]) -> Result<(), Error> {
        let cp_len = self.config.cpointer_size.byte_len();
        if body.len() != 1 + cp_len + 4 {
            return Err(Error::InvalidMessage("bad breakpoint update size"));
        }
        let enable = body[0] != 0;
        let cp = ByteCodeCp::read(self.config.cpointer_size, &body[1..])
            .ok_or(Error::InvalidMessage("truncated bytecode pointer"))?;
        let offset = read_u32(&body[1 + cp_len..])?;

        self.breakpoints.update(cp, offset, enable)
    }

    fn handle_memstats(&mut self) -> Result<(), Error> {
        let stats = self.hooks.memstats();
        let mut body = Vec::with_capacity(20);
        for counter in [
            stats.allocated_bytes,
            stats.byte_code_bytes,
            stats.string_bytes,
            stats.object_bytes,
            stats.property_bytes,
        ] {
            body.extend_from_slice(&counter.to_ne_bytes());
        }
        self.session.send_data(OutMessage::MemstatsReceive, &body)
    }

    fn handle_get_backtrace(&mut self, body: &[u8]) -> Result<(), Error> {
        let max_depth = read_u32(body)?;
        let frames = self.hooks.backtrace(max_depth);

        if frames.is_empty() {
            return self.session.send_type(OutMessage::BacktraceEnd);
        }

        let cp_size = self.config.cpointer_size;
        let entry_len = cp_size.byte_len() + 4;
        let per_message = ((self.session.max_send_payload() - 1) / entry_len).max(1);

        let mut chunks = frames.chunks(per_message).peekable();
        while let Some(chunk) = chunks.next() {
            let mut body = Vec::with_capacity(chunk.len() * entry_len);
            for frame in chunk {
                frame.byte_code.write(cp_size, &mut body);
                body.extend_from_slice(&frame.offset.to_ne_bytes());
            }
            let message = if chunks.peek().is_some() {
                OutMessage::Backtrace
            } else {
                OutMessage::BacktraceEnd
            };
            self.session.send_data(message, &body)?;
        }
        Ok(())
    }

    /// First message of a fragmented transfer: announced total size, then
    /// the head slice.
    fn start_transfer(&mut self, kind: TransferKind, body: &[u8]) -> Result<(), Error> {
        if self.transfer.is_some() {
            return Err(Error::TransferInProgress);
        }
        if body.len() < 4 {
            return Err(Error::InvalidMessage("missing transfer size"));
        }
        let total = read_u32(&body[..4])?;
        if total > self.config.max_transfer_size {
            return Err(Error::TransferTooLarge(total));
        }

        let head = &body[4..];
        if head.len() > total as usize {
            return Err(Error::InvalidMessage("transfer head over announced size"));
        }

        let mut data = Vec::with_capacity(total as usize);
        data.extend_from_slice(head);
        let transfer = Transfer {
            kind,
            total: total as usize,
            data,
        };
        self.advance_transfer(transfer)
    }

    fn continue_transfer(&mut self, body: &[u8]) -> Result<(), Error> {
        let Some(mut transfer) = self.transfer.take() else {
            return Err(Error::InvalidMessage("transfer part without a start"));
        };
        if transfer.data.len() + body.len() > transfer.total {
            return Err(Error::InvalidMessage("transfer over announced size"));
        }
        transfer.data.extend_from_slice(body);
        self.advance_transfer(transfer)
    }

    fn advance_transfer(&mut self, transfer: Transfer) -> Result<(), Error> {
        if transfer.data.len() < transfer.total {
            self.transfer = Some(transfer);
            return Ok(());
        }

        match transfer.kind {
            TransferKind::Eval => self.finish_eval(transfer.data),
            TransferKind::Throw => {
                // resume execution, the exception surfaces at the safepoint
                self.pending_throw = Some(transfer.data);
                self.resume(false, StepScope::Any);
                Ok(())
            }
            TransferKind::ClientSource => {
                self.source_event = Some(SourceEvent::Received(transfer.data));
                Ok(())
            }
        }
    }

    fn finish_eval(&mut self, data: Vec<u8>) -> Result<(), Error> {
        let kind_byte = *data
            .first()
            .ok_or(Error::InvalidMessage("empty eval request"))?;
        let kind =
            EvalKind::from_u8(kind_byte).ok_or(Error::InvalidMessage("unknown eval request"))?;

        let outcome = self.hooks.eval(kind, &data[1..]).map_err(Error::Hook)?;
        let (subtype, result) = match &outcome {
            EvalOutcome::Ok(result) => (EvalSubtype::Ok, result),
            EvalOutcome::Error(message) => (EvalSubtype::Error, message),
        };
        self.session.send_string(
            OutMessage::EvalResult,
            OutMessage::EvalResultEnd,
            Some(subtype as u8),
            result,
        )
    }
}

/// The mode-dependent acceptance table. A handful of maintenance commands
/// work everywhere; the rest is tied to exactly one waiting state.
fn accepted_in_mode(mode: ExecMode, message: InMessage) -> bool {
    use InMessage::*;
    match message {
        FreeByteCodeCp | UpdateBreakpoint | ExceptionConfig | ParserConfig | Memstats | Stop => {
            true
        }
        ParserResume => mode == ExecMode::ParserWait,
        ClientSource | ClientSourcePart | NoMoreSources | ContextReset => {
            mode == ExecMode::ClientSource
        }
        Continue | Step | Next | Finish | GetBacktrace | Eval | EvalPart | Throw | ThrowPart => {
            mode == ExecMode::Breakpoint
        }
    }
}
