//! Byte-stream transport abstraction.
//! The bundled implementation is plain TCP; alternate transports (serial,
//! in-process pipes) implement the same trait on the host side.

use crate::debugger::error::Error;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};

/// One-client byte transport consumed by the debugger server.
pub trait Transport {
    /// Bind the given port and block until a single client connects.
    fn accept(&mut self, port: u16) -> Result<(), Error>;

    /// Switch the established connection between blocking and nonblocking
    /// receive semantics.
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), Error>;

    /// Push the whole buffer to the client, retrying on would-block. Upper
    /// layers rely on frame atomicity, so partial commits are not allowed.
    fn send(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Read available bytes into `buf`. Returns 0 when no data is pending
    /// (would-block); a closed peer is an error.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Drop the connection. Idempotent.
    fn close(&mut self);
}

/// TCP transport over the standard library socket types.
#[derive(Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> Result<&mut TcpStream, Error> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }
}

impl Transport for TcpTransport {
    fn accept(&mut self, port: u16) -> Result<(), Error> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        log::debug!(target: "debugger", "waiting for client connection on port {port}");

        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        log::debug!(target: "debugger", "connected from: {peer}");

        // the listener is dropped here: exactly one client per session
        self.stream = Some(stream);
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), Error> {
        Ok(self.stream()?.set_nonblocking(nonblocking)?)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let stream = self.stream()?;
        let mut rest = data;
        while !rest.is_empty() {
            match stream.write(rest) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => rest = &rest[n..],
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream()?.read(buf) {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
