use thiserror::Error;

/// The set of observable errors when interacting with a Gearman server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection to the server, or one of its prerequisites, failed.
    #[error("connection error: {0}")]
    Connect(#[from] Connect),

    /// Underlying io layer errors.
    ///
    /// These are overwhelmingly network communication errors on the socket
    /// connection to the server.
    #[error("underlying i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Application-level errors.
    ///
    /// These generally indicate a mismatch between what the client expects
    /// and what the server sent, and are fatal to the connection unless
    /// noted otherwise on the variant.
    #[error("protocol: {0}")]
    Protocol(#[from] Protocol),

    /// A command was requested by a name or code the catalog does not know.
    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    /// The arguments supplied to the command factory do not match the
    /// command's field schema.
    #[error("bad arguments for {command}: {message}")]
    Argument {
        /// The command being constructed.
        command: &'static str,
        /// What was wrong with the supplied arguments.
        message: String,
    },

    /// A foreground job with this `(function, unique_id)` pair is already in
    /// flight on this client.
    ///
    /// Raised before any bytes are sent; the existing task must reach a
    /// terminal event (or be cancelled) before the pair can be reused.
    #[error("duplicate job: {function}/{unique_id} is already in flight")]
    DuplicateJob {
        /// The function name of the conflicting submission.
        function: String,
        /// The unique id of the conflicting submission.
        unique_id: String,
    },

    /// `set_option` was called with an option this library does not support.
    ///
    /// The only recognized option is `exceptions`.
    #[error("unsupported connection option: {0}")]
    UnsupportedOption(String),

    /// A job operation was attempted after the job already reached a
    /// terminal verdict (complete, fail, or exception).
    #[error("job has already reached a terminal verdict")]
    JobFinished,

    /// The connection is closed; all outstanding operations are cancelled.
    #[error("connection closed")]
    ConnectionClosed,
}

/// The set of errors that can occur while establishing a connection.
///
/// The factory surface distinguishes failure to reach the server from a
/// server that accepted the connection but failed the initial echo ping.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Connect {
    /// The TCP dial itself failed.
    #[error("failed to dial server: {0}")]
    Dial(#[source] std::io::Error),

    /// The connection was established, but the initial ping did not
    /// complete.
    #[error("initial ping failed: {0}")]
    Ping(#[source] Box<Error>),
}

/// The set of application-level protocol errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Protocol {
    /// A frame arrived with a magic prefix that is neither `\0REQ` nor
    /// `\0RES`.
    #[error("bad magic bytes {bytes:?}")]
    BadMagic {
        /// The four bytes received in the magic position.
        bytes: [u8; 4],
    },

    /// A frame arrived with a command code the catalog does not know.
    #[error("unknown command code {code}")]
    UnknownCode {
        /// The code received in the type position.
        code: u32,
    },

    /// A frame's payload does not match its command's field schema.
    #[error("malformed {command} frame: {error}")]
    Malformed {
        /// The command whose frame was malformed.
        command: &'static str,
        /// A description of what was wrong with the payload.
        error: &'static str,
    },

    /// A response arrived that does not correlate with the head of the
    /// in-flight request queue.
    #[error("expected {expected}, got {received}")]
    UnexpectedResponse {
        /// The response the head in-flight request was waiting for.
        expected: &'static str,
        /// The command that actually arrived.
        received: &'static str,
    },

    /// A response correlated with its request but echoed back a different
    /// value than was sent (handle, option name, or echo payload).
    #[error("{command} response mismatch: sent {sent:?}, received {received:?}")]
    ResponseMismatch {
        /// The response command that mismatched.
        command: &'static str,
        /// The value this side sent.
        sent: String,
        /// The value the server returned.
        received: String,
    },

    /// The server reported an error via the `ERROR` command.
    ///
    /// Rejects the correlated request if one is outstanding; not fatal to
    /// the connection.
    #[error("server error {code}: {text}")]
    Server {
        /// The server's error code string.
        code: String,
        /// The server's human-readable error text.
        text: String,
    },
}
