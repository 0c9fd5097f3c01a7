#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use gearman::{Codec, Command, CommandType};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// A frame-level stand-in for gearmand on the far side of an in-memory
/// duplex stream.
pub struct MockServer {
    stream: DuplexStream,
    codec: Codec,
}

impl MockServer {
    /// A connected (participant stream, mock server) pair.
    pub fn pair() -> (DuplexStream, MockServer) {
        let (participant, server) = tokio::io::duplex(64 * 1024);
        (
            participant,
            MockServer {
                stream: server,
                codec: Codec::new(),
            },
        )
    }

    /// The next frame the participant wrote.
    pub async fn recv(&mut self) -> Command {
        loop {
            if let Some(command) = self.codec.decode().unwrap() {
                return command;
            }
            let mut buf = [0u8; 1024];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "participant closed the connection");
            self.codec.feed(&buf[..n]);
        }
    }

    /// The next frame, asserted to be of the given kind.
    pub async fn expect(&mut self, kind: CommandType) -> Command {
        let command = self.recv().await;
        assert_eq!(
            command.kind(),
            kind,
            "expected {}, got {}",
            kind.name(),
            command.name()
        );
        command
    }

    /// Assert that the participant sends nothing for a little while.
    pub async fn expect_silence(&mut self) {
        let mut buf = [0u8; 256];
        match tokio::time::timeout(Duration::from_millis(50), self.stream.read(&mut buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("expected silence, got {n} bytes"),
            Ok(Err(e)) => panic!("read failed: {e}"),
        }
    }

    pub async fn send(&mut self, command: &Command) {
        self.stream.write_all(&Codec::encode(command)).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Answer the echo ping every connect performs.
    pub async fn handshake(&mut self) {
        let echo = self.expect(CommandType::EchoReq).await;
        self.echo_back(&echo).await;
    }

    /// The raw far-side stream, for EOF assertions.
    pub fn stream_mut(&mut self) -> &mut DuplexStream {
        &mut self.stream
    }

    /// Mirror an ECHO_REQ back as ECHO_RES.
    pub async fn echo_back(&mut self, echo: &Command) {
        let data = echo.arg("data").cloned().unwrap();
        self.send(&Command::response(CommandType::EchoRes, [("data", data)]).unwrap())
            .await;
    }
}

// response frame constructors, shared by the client and worker suites

pub fn job_created(handle: &str) -> Command {
    Command::response(
        CommandType::JobCreated,
        [("handle", Bytes::copy_from_slice(handle.as_bytes()))],
    )
    .unwrap()
}

pub fn work_data(handle: &str, data: &str) -> Command {
    relayed(CommandType::WorkData, handle, data)
}

pub fn work_warning(handle: &str, data: &str) -> Command {
    relayed(CommandType::WorkWarning, handle, data)
}

pub fn work_complete(handle: &str, data: &str) -> Command {
    relayed(CommandType::WorkComplete, handle, data)
}

pub fn work_exception(handle: &str, data: &str) -> Command {
    relayed(CommandType::WorkException, handle, data)
}

pub fn work_fail(handle: &str) -> Command {
    Command::response(
        CommandType::WorkFail,
        [("handle", Bytes::copy_from_slice(handle.as_bytes()))],
    )
    .unwrap()
}

pub fn work_status(handle: &str, numerator: u64, denominator: u64) -> Command {
    Command::response(
        CommandType::WorkStatus,
        [
            ("handle", Bytes::copy_from_slice(handle.as_bytes())),
            ("numerator", Bytes::from(numerator.to_string())),
            ("denominator", Bytes::from(denominator.to_string())),
        ],
    )
    .unwrap()
}

pub fn status_res(handle: &str, known: bool, running: bool, num: u64, den: u64) -> Command {
    Command::response(
        CommandType::StatusRes,
        [
            ("handle", Bytes::copy_from_slice(handle.as_bytes())),
            ("known", Bytes::from_static(if known { b"1" } else { b"0" })),
            ("running", Bytes::from_static(if running { b"1" } else { b"0" })),
            ("numerator", Bytes::from(num.to_string())),
            ("denominator", Bytes::from(den.to_string())),
        ],
    )
    .unwrap()
}

pub fn option_res(option: &str) -> Command {
    Command::response(
        CommandType::OptionRes,
        [("option", Bytes::copy_from_slice(option.as_bytes()))],
    )
    .unwrap()
}

pub fn server_error(code: &str, text: &str) -> Command {
    Command::response(
        CommandType::Error,
        [
            ("code", Bytes::copy_from_slice(code.as_bytes())),
            ("text", Bytes::copy_from_slice(text.as_bytes())),
        ],
    )
    .unwrap()
}

pub fn no_job() -> Command {
    Command::response(CommandType::NoJob, []).unwrap()
}

pub fn noop() -> Command {
    Command::response(CommandType::Noop, []).unwrap()
}

pub fn job_assign(handle: &str, function: &str, data: &str) -> Command {
    Command::response(
        CommandType::JobAssign,
        [
            ("handle", Bytes::copy_from_slice(handle.as_bytes())),
            ("function_name", Bytes::copy_from_slice(function.as_bytes())),
            ("data", Bytes::copy_from_slice(data.as_bytes())),
        ],
    )
    .unwrap()
}

pub fn job_assign_uniq(handle: &str, function: &str, unique_id: &str, data: &str) -> Command {
    Command::response(
        CommandType::JobAssignUniq,
        [
            ("handle", Bytes::copy_from_slice(handle.as_bytes())),
            ("function_name", Bytes::copy_from_slice(function.as_bytes())),
            ("unique_id", Bytes::copy_from_slice(unique_id.as_bytes())),
            ("data", Bytes::copy_from_slice(data.as_bytes())),
        ],
    )
    .unwrap()
}

fn relayed(kind: CommandType, handle: &str, data: &str) -> Command {
    Command::response(
        kind,
        [
            ("handle", Bytes::copy_from_slice(handle.as_bytes())),
            ("data", Bytes::copy_from_slice(data.as_bytes())),
        ],
    )
    .unwrap()
}
