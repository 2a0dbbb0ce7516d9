//! HTTP upgrade handshake.
//!
//! The client opens the session with a `GET /jerry-debugger` upgrade request;
//! the server answers 101 with the RFC-6455 accept key and the connection
//! switches to framed binary messages.

use crate::debugger::error::Error;
use crate::debugger::transport::Transport;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

const REQUEST_BUFFER_SIZE: usize = 1024;
const REQUEST_PREFIX: &[u8] = b"GET /jerry-debugger";
const KEY_HEADER: &[u8] = b"Sec-WebSocket-Key:";
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Drive the upgrade on a freshly accepted (still blocking) connection.
pub fn perform<T: Transport>(transport: &mut T) -> Result<(), Error> {
    let mut request = [0u8; REQUEST_BUFFER_SIZE];
    let mut len = 0;

    // buffer request text until the double newline arrives
    loop {
        if len == request.len() {
            return Err(Error::HandshakeOverflow);
        }
        let read = transport.receive(&mut request[len..])?;
        len += read;

        if len >= 4 && request[..len].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let request = &request[..len];

    if !request.starts_with(REQUEST_PREFIX) {
        return Err(Error::InvalidHandshake);
    }

    let key = find_key(&request[REQUEST_PREFIX.len()..])?;
    let accept = accept_key(key);

    let mut response = Vec::with_capacity(160);
    response.extend_from_slice(
        b"HTTP/1.1 101 Switching Protocols\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Accept: ",
    );
    response.extend_from_slice(accept.as_bytes());
    response.extend_from_slice(b"\r\n\r\n");

    transport.send(&response)
}

/// Locate the key value. The header name only counts when it starts a line,
/// leading spaces are skipped and the value ends at the first control or
/// space byte.
fn find_key(request: &[u8]) -> Result<&[u8], Error> {
    let mut rest = request;
    loop {
        let line_start = match rest.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => &rest[pos + 2..],
            None => return Err(Error::WebSocketKeyMissing),
        };
        if line_start.starts_with(KEY_HEADER) {
            let value = &line_start[KEY_HEADER.len()..];
            let start = value
                .iter()
                .position(|&b| b != b' ')
                .ok_or(Error::WebSocketKeyMissing)?;
            let value = &value[start..];
            let end = value.iter().position(|&b| b <= b' ').unwrap_or(value.len());
            if end == 0 {
                return Err(Error::WebSocketKeyMissing);
            }
            return Ok(&value[..end]);
        }
        rest = line_start;
    }
}

/// `base64(sha1(key || GUID))`: a 20-byte digest becomes 28 base64
/// characters ending in `=`.
fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    STANDARD.encode(sha1.finalize())
}
