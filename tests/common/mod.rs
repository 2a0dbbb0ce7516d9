use jsprobe::debugger::error::Error;
use jsprobe::debugger::protocol::{ByteCodeCp, EvalKind};
use jsprobe::debugger::transport::Transport;
use jsprobe::debugger::{BacktraceFrame, EngineHook, EvalOutcome, MemStats};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub const HANDSHAKE_REQUEST: &[u8] = b"GET /jerry-debugger HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

pub const EXPECTED_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Scripted client side of a session. Every chunk is gated on the number of
/// server send calls observed so far, which keeps request/response ordering
/// deterministic without threads or sleeps.
#[derive(Default)]
pub struct Wire {
    chunks: VecDeque<(usize, Vec<u8>)>,
    pub sent: Vec<u8>,
    pub send_calls: usize,
    receive_calls: usize,
    pub close_when_drained: bool,
    pub closed: Cell<bool>,
}

impl Wire {
    /// Queue client bytes that become readable once the server has issued
    /// `after_sends` send calls (the handshake response counts as one).
    pub fn push(&mut self, after_sends: usize, bytes: Vec<u8>) {
        self.chunks.push_back((after_sends, bytes));
    }

    /// Frames the server sent after the handshake response.
    pub fn egress_frames(&self) -> Vec<Vec<u8>> {
        let terminator = b"\r\n\r\n";
        let body_start = self
            .sent
            .windows(terminator.len())
            .position(|w| w == terminator)
            .map(|pos| pos + terminator.len())
            .unwrap_or(0);

        let mut frames = vec![];
        let mut rest = &self.sent[body_start..];
        while !rest.is_empty() {
            assert_eq!(rest[0], 0x82, "egress frames are always FIN|BINARY");
            let len = rest[1] as usize;
            assert!(len <= 125, "egress length fits the one-byte form");
            frames.push(rest[2..2 + len].to_vec());
            rest = &rest[2 + len..];
        }
        frames
    }

    pub fn handshake_response(&self) -> String {
        let terminator = b"\r\n\r\n";
        let end = self
            .sent
            .windows(terminator.len())
            .position(|w| w == terminator)
            .expect("no handshake response on the wire")
            + terminator.len();
        String::from_utf8(self.sent[..end].to_vec()).expect("response is not text")
    }
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub wire: Rc<RefCell<Wire>>,
}

impl Transport for ScriptedTransport {
    fn accept(&mut self, _port: u16) -> Result<(), Error> {
        Ok(())
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<(), Error> {
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut wire = self.wire.borrow_mut();
        wire.sent.extend_from_slice(data);
        wire.send_calls += 1;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut wire = self.wire.borrow_mut();
        wire.receive_calls += 1;
        assert!(
            wire.receive_calls < 100_000,
            "test wire drained, the server is waiting for input that never comes"
        );

        match wire.chunks.front() {
            Some((after, _)) if wire.send_calls >= *after => {}
            Some(_) => return Ok(0),
            None if wire.close_when_drained => return Err(Error::ConnectionClosed),
            None => return Ok(0),
        }

        let (after, mut chunk) = wire.chunks.pop_front().expect("front checked above");
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            wire.chunks.push_front((after, chunk));
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.wire.borrow_mut().closed.set(true);
    }
}

/// Wrap a message payload into a masked client frame.
pub fn client_frame(payload: &[u8]) -> Vec<u8> {
    let mask = [0xa5, 0x5a, 0x0f, 0xf0];
    let mut out = vec![0x82, 0x80 | payload.len() as u8];
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

/// Shared recorder the test keeps while the server owns the hook object.
#[derive(Clone, Default)]
pub struct EngineProbe {
    pub depth: Rc<Cell<u32>>,
    pub eval_requests: Rc<RefCell<Vec<(EvalKind, Vec<u8>)>>>,
    pub eval_reply: Rc<RefCell<Option<EvalOutcome>>>,
    pub frames: Rc<RefCell<Vec<BacktraceFrame>>>,
    pub stats: Rc<Cell<MemStats>>,
    pub freed: Rc<RefCell<Vec<ByteCodeCp>>>,
}

pub struct ProbeHooks {
    pub probe: EngineProbe,
}

impl ProbeHooks {
    pub fn new(probe: EngineProbe) -> Self {
        Self { probe }
    }
}

impl EngineHook for ProbeHooks {
    fn eval(&mut self, kind: EvalKind, source: &[u8]) -> anyhow::Result<EvalOutcome> {
        self.probe
            .eval_requests
            .borrow_mut()
            .push((kind, source.to_vec()));
        Ok(self
            .probe
            .eval_reply
            .borrow()
            .clone()
            .unwrap_or(EvalOutcome::Ok(b"undefined".to_vec())))
    }

    fn backtrace(&mut self, max_depth: u32) -> Vec<BacktraceFrame> {
        let frames = self.probe.frames.borrow();
        match max_depth {
            0 => frames.clone(),
            depth => frames.iter().take(depth as usize).copied().collect(),
        }
    }

    fn frame_depth(&mut self) -> u32 {
        self.probe.depth.get()
    }

    fn memstats(&mut self) -> MemStats {
        self.probe.stats.get()
    }

    fn free_byte_code(&mut self, cp: ByteCodeCp) {
        self.probe.freed.borrow_mut().push(cp);
    }
}
