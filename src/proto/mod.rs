//! The protocol core: command catalog, framing codec, connection, and
//! request/response correlation shared by both participants.

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) mod command;
pub(crate) mod codec;
pub(crate) mod rpc;

pub use command::{Command, CommandType, Magic};
pub use codec::{Codec, HEADER_SIZE};

use crate::error::Error;

/// The port gearmand listens on by default.
pub const DEFAULT_PORT: u16 = 4730;

const ECHO_PAYLOAD_LEN: usize = 16;

/// One TCP byte stream plus the framing codec.
///
/// Writes go out in call order; reads accumulate into the codec so a
/// cancelled [`read_command`](Connection::read_command) never loses a
/// partial frame. Whether reads happen at all is the owning participant's
/// decision (the backpressure gate).
pub(crate) struct Connection<S> {
    stream: S,
    codec: Codec,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub(crate) fn new(stream: S) -> Connection<S> {
        Connection {
            stream,
            codec: Codec::new(),
        }
    }

    /// Encode and transmit one command, flushing the stream.
    pub(crate) async fn send(&mut self, command: &Command) -> Result<(), Error> {
        tracing::trace!(command = command.name(), "sending");
        let frame = Codec::encode(command);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next complete command off the stream.
    ///
    /// Cancellation-safe: bytes consumed from the socket are retained in
    /// the codec buffer across cancelled calls. A clean EOF surfaces as
    /// [`Error::ConnectionClosed`].
    pub(crate) async fn read_command(&mut self) -> Result<Command, Error> {
        loop {
            if let Some(command) = self.codec.decode()? {
                tracing::trace!(command = command.name(), "received");
                return Ok(command);
            }
            let read = self.stream.read_buf(self.codec.buffer_mut()).await?;
            if read == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

/// A fresh random payload for an ECHO_REQ ping; the response must carry it
/// back unchanged.
pub(crate) fn echo_payload() -> Bytes {
    let mut payload = [0u8; ECHO_PAYLOAD_LEN];
    rand::thread_rng().fill(&mut payload[..]);
    Bytes::copy_from_slice(&payload)
}
