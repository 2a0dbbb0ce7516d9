//! Connection session: fixed transmit buffers and the outgoing message
//! primitives.
//!
//! One frame must fit the buffer whole, header included, which caps every
//! outgoing payload at `max_send_payload` bytes. Anything longer goes out as
//! a fragmented stream: every chunk but the last carries the continuation
//! type, the final chunk (possibly empty) carries the end type.

use crate::debugger::error::Error;
use crate::debugger::frame::{self, MASK_SIZE, MAX_ONE_BYTE_LEN};
use crate::debugger::protocol::{ByteCodeCp, CpSize, OutMessage, MAX_BUFFER_SIZE, PROTOCOL_VERSION};
use crate::debugger::transport::Transport;

pub struct Session<T: Transport> {
    transport: T,
    connected: bool,
    send_buf: [u8; MAX_BUFFER_SIZE],
    recv_buf: [u8; MAX_BUFFER_SIZE],
    recv_offset: usize,
    send_header_size: usize,
    recv_header_size: usize,
    max_send_payload: usize,
    max_recv_payload: usize,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            connected: false,
            send_buf: [0; MAX_BUFFER_SIZE],
            recv_buf: [0; MAX_BUFFER_SIZE],
            recv_offset: 0,
            send_header_size: frame::SEND_HEADER_SIZE,
            recv_header_size: frame::RECV_HEADER_SIZE,
            max_send_payload: Self::clamp_payload(MAX_BUFFER_SIZE - frame::SEND_HEADER_SIZE),
            max_recv_payload: Self::clamp_payload(MAX_BUFFER_SIZE - frame::RECV_HEADER_SIZE),
        }
    }

    fn clamp_payload(size: usize) -> usize {
        size.min(MAX_ONE_BYTE_LEN)
    }

    /// Override framing overheads for transports with different headers.
    pub fn set_transmit_sizes(
        &mut self,
        send_header: usize,
        max_send: usize,
        recv_header: usize,
        max_recv: usize,
    ) {
        self.send_header_size = send_header;
        self.recv_header_size = recv_header;
        self.max_send_payload = Self::clamp_payload(max_send.min(MAX_BUFFER_SIZE - send_header));
        self.max_recv_payload = Self::clamp_payload(max_recv.min(MAX_BUFFER_SIZE - recv_header));
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn max_send_payload(&self) -> usize {
        self.max_send_payload
    }

    pub fn max_recv_payload(&self) -> usize {
        self.max_recv_payload
    }

    /// Wait for a client and run the upgrade handshake. On success the
    /// socket is switched to nonblocking mode.
    pub fn accept(&mut self, port: u16) -> Result<(), Error> {
        self.transport.accept(port)?;
        self.connected = true;
        self.recv_offset = 0;

        if let Err(e) = super::handshake::perform(&mut self.transport) {
            self.close();
            return Err(e);
        }
        if let Err(e) = self.transport.set_nonblocking(true) {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.connected {
            log::debug!(target: "debugger", "debugger client connection closed");
        }
        self.transport.close();
        self.connected = false;
        self.recv_offset = 0;
    }

    /// Push the frame currently staged in the send buffer. On any transport
    /// failure the session is closed before the error is returned.
    fn send_frame(&mut self, payload_len: usize) -> Result<(), Error> {
        debug_assert!(payload_len <= self.max_send_payload);
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let header_start = self.send_header_size - frame::SEND_HEADER_SIZE;
        frame::write_send_header(
            &mut self.send_buf[header_start..self.send_header_size],
            payload_len,
        );

        let total = self.send_header_size + payload_len;
        if let Err(e) = self.transport.send(&self.send_buf[header_start..total]) {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Send a message that consists of the type byte alone.
    pub fn send_type(&mut self, message: OutMessage) -> Result<(), Error> {
        self.send_data(message, &[])
    }

    /// Send a typed message whose body fits one frame.
    pub fn send_data(&mut self, message: OutMessage, body: &[u8]) -> Result<(), Error> {
        debug_assert!(1 + body.len() <= self.max_send_payload);
        let start = self.send_header_size;
        self.send_buf[start] = message as u8;
        self.send_buf[start + 1..start + 1 + body.len()].copy_from_slice(body);
        self.send_frame(1 + body.len())
    }

    /// Stream a byte string as a fragmented message pair. An optional
    /// subtype byte is prefixed to the stream content.
    pub fn send_string(
        &mut self,
        continuation: OutMessage,
        end: OutMessage,
        subtype: Option<u8>,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut stream = Vec::with_capacity(data.len() + 1);
        if let Some(subtype) = subtype {
            stream.push(subtype);
        }
        stream.extend_from_slice(data);

        let max_chunk = self.max_send_payload - 1;
        let mut rest = stream.as_slice();
        while rest.len() > max_chunk {
            self.send_data(continuation, &rest[..max_chunk])?;
            rest = &rest[max_chunk..];
        }
        self.send_data(end, rest)
    }

    /// Send a compressed bytecode pointer at the configured wire width.
    pub fn send_function_cp(
        &mut self,
        message: OutMessage,
        cp: ByteCodeCp,
        cp_size: CpSize,
    ) -> Result<(), Error> {
        let mut body = Vec::with_capacity(4);
        cp.write(cp_size, &mut body);
        self.send_data(message, &body)
    }

    /// Report the source position of a freshly parsed function.
    pub fn send_parse_function(&mut self, line: u32, column: u32) -> Result<(), Error> {
        let mut body = [0u8; 8];
        body[..4].copy_from_slice(&line.to_ne_bytes());
        body[4..].copy_from_slice(&column.to_ne_bytes());
        self.send_data(OutMessage::ParseFunction, &body)
    }

    /// Stream a list of 32-bit values as repeated messages of one type.
    pub fn send_u32_list(&mut self, message: OutMessage, values: &[u32]) -> Result<(), Error> {
        let per_message = (self.max_send_payload - 1) / 4;
        for chunk in values.chunks(per_message.max(1)) {
            let mut body = Vec::with_capacity(chunk.len() * 4);
            for value in chunk {
                body.extend_from_slice(&value.to_ne_bytes());
            }
            self.send_data(message, &body)?;
        }
        Ok(())
    }

    /// First message after the handshake: what the client may send and how
    /// to read our numbers.
    pub fn send_configuration(&mut self, cp_size: CpSize) -> Result<(), Error> {
        let body = [
            self.max_recv_payload as u8,
            cp_size.byte_len() as u8,
            cfg!(target_endian = "little") as u8,
            PROTOCOL_VERSION,
        ];
        self.send_data(OutMessage::Configuration, &body)
    }

    /// Attempt to complete one incoming frame. Performs a single receive,
    /// then, if a whole frame is buffered, validates it, copies the unmasked
    /// payload into `out` and consumes it. `Ok(None)` means no complete
    /// frame yet.
    pub fn recv_frame(&mut self, out: &mut [u8]) -> Result<Option<usize>, Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let read = match self
            .transport
            .receive(&mut self.recv_buf[self.recv_offset..])
        {
            Ok(n) => n,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };
        self.recv_offset += read;

        if self.recv_offset < self.recv_header_size {
            return Ok(None);
        }

        let header =
            frame::validate_recv_header(self.recv_buf[0], self.recv_buf[1], self.max_recv_payload)?;

        let total = self.recv_header_size + header.payload_len;
        if self.recv_offset < total {
            return Ok(None);
        }

        let mask_start = self.recv_header_size - MASK_SIZE;
        let mut mask = [0u8; MASK_SIZE];
        mask.copy_from_slice(&self.recv_buf[mask_start..self.recv_header_size]);

        let payload = &mut out[..header.payload_len];
        payload.copy_from_slice(&self.recv_buf[self.recv_header_size..total]);
        frame::unmask(&mask, payload);

        self.recv_buf.copy_within(total..self.recv_offset, 0);
        self.recv_offset -= total;

        Ok(Some(header.payload_len))
    }
}
