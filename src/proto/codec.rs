//! The framing codec: bit-exact encode/decode of commands over a byte
//! stream.
//!
//! Each frame is `magic(4B) | code(u32 BE) | len(u32 BE) | payload`, where
//! the payload holds the command's schema fields separated by single NUL
//! bytes. The final field carries no trailing NUL and, for data-bearing
//! commands, may itself contain NULs; splitting therefore happens exactly
//! `N - 1` times for an `N`-field schema.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::command::{Command, CommandType, Magic};
use crate::error::{Error, Protocol};

/// Frame header size: magic + code + payload length.
pub const HEADER_SIZE: usize = 12;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// A stateful frame decoder over an accumulation buffer.
///
/// Bytes are [`feed`](Codec::feed) in as they arrive from the socket;
/// [`decode`](Codec::decode) yields complete commands and never consumes a
/// partial frame, so reads can be cancelled between frames without losing
/// position.
#[derive(Debug, Default)]
pub struct Codec {
    buf: BytesMut,
}

impl Codec {
    /// A fresh decoder with an empty accumulation buffer.
    pub fn new() -> Codec {
        Codec {
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Append raw bytes from the stream to the accumulation buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The accumulation buffer, for reading directly off a socket.
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Try to decode one complete frame from the buffer.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame.
    /// Invalid magic, an unknown command code, or a payload that does not
    /// match the command's schema are protocol errors and fatal to the
    /// connection.
    pub fn decode(&mut self) -> Result<Option<Command>, Error> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic_bytes = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let magic =
            Magic::from_bytes(magic_bytes).ok_or(Protocol::BadMagic { bytes: magic_bytes })?;
        let code = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        let kind = CommandType::from_code(code).ok_or(Protocol::UnknownCode { code })?;
        let len = u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize;

        if self.buf.len() < HEADER_SIZE + len {
            // partial frame; leave the header in place
            self.buf.reserve(HEADER_SIZE + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let payload = self.buf.split_to(len).freeze();
        let args = split_fields(kind, payload)?;
        Ok(Some(Command::from_wire(magic, kind, args)))
    }

    /// Encode a command to its wire frame.
    ///
    /// [`Command`] values always carry a full argument vector (the factory
    /// refuses to build anything else), so encoding cannot fail.
    pub fn encode(command: &Command) -> Bytes {
        let args = command.args();
        let len: usize =
            args.iter().map(Bytes::len).sum::<usize>() + args.len().saturating_sub(1);

        let mut out = BytesMut::with_capacity(HEADER_SIZE + len);
        out.put_slice(&command.magic().bytes());
        out.put_u32(command.kind().code());
        out.put_u32(len as u32);
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                out.put_u8(0);
            }
            out.put_slice(arg);
        }
        out.freeze()
    }
}

/// Split a payload into its schema fields: exactly `N - 1` NUL splits, so
/// the final field keeps any embedded NULs.
fn split_fields(kind: CommandType, payload: Bytes) -> Result<Vec<Bytes>, Error> {
    let count = kind.fields().len();
    if count == 0 {
        if !payload.is_empty() {
            return Err(Protocol::Malformed {
                command: kind.name(),
                error: "unexpected payload on a zero-field command",
            }
            .into());
        }
        return Ok(Vec::new());
    }

    let mut rest = payload;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count - 1 {
        let sep = rest.iter().position(|b| *b == 0).ok_or(Protocol::Malformed {
            command: kind.name(),
            error: "fewer fields than the schema requires",
        })?;
        args.push(rest.split_to(sep));
        rest.advance(1);
    }
    args.push(rest);
    Ok(args)
}
