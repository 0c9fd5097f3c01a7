//! The command catalog: every frame type the engine speaks, its numeric
//! code, and its ordered field schema.
//!
//! Gearman commands all share one wire shape (NUL-separated string fields
//! with an optional trailing opaque data field), so rather than one struct
//! per command this module keeps a static table and a single [`Command`]
//! value validated against it.

use bytes::Bytes;

use crate::error::{Error, Protocol};

/// The direction marker carried in the first four bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// `\0REQ` — a request frame.
    Request,
    /// `\0RES` — a response frame.
    Response,
}

impl Magic {
    /// The four magic bytes this marker encodes to.
    pub fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => *b"\0REQ",
            Magic::Response => *b"\0RES",
        }
    }

    /// Decode a magic marker, if the bytes match one.
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Magic> {
        match &bytes {
            b"\0REQ" => Some(Magic::Request),
            b"\0RES" => Some(Magic::Response),
            _ => None,
        }
    }
}

/// The name of the opaque trailing field in schemas that carry one.
const DATA_FIELD: &str = "data";

/// A command type: a name, a numeric wire code, and an ordered field schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CommandType {
    CanDo,
    CantDo,
    ResetAbilities,
    PreSleep,
    Noop,
    SubmitJob,
    JobCreated,
    GrabJob,
    NoJob,
    JobAssign,
    WorkStatus,
    WorkComplete,
    WorkFail,
    GetStatus,
    EchoReq,
    EchoRes,
    SubmitJobBg,
    Error,
    StatusRes,
    SubmitJobHigh,
    WorkException,
    OptionReq,
    OptionRes,
    WorkData,
    WorkWarning,
    GrabJobUniq,
    JobAssignUniq,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
}

struct Descriptor {
    kind: CommandType,
    code: u32,
    name: &'static str,
    fields: &'static [&'static str],
}

static CATALOG: &[Descriptor] = &[
    Descriptor { kind: CommandType::CanDo, code: 1, name: "CAN_DO", fields: &["function_name"] },
    Descriptor { kind: CommandType::CantDo, code: 2, name: "CANT_DO", fields: &["function_name"] },
    Descriptor { kind: CommandType::ResetAbilities, code: 3, name: "RESET_ABILITIES", fields: &[] },
    Descriptor { kind: CommandType::PreSleep, code: 4, name: "PRE_SLEEP", fields: &[] },
    Descriptor { kind: CommandType::Noop, code: 6, name: "NOOP", fields: &[] },
    Descriptor { kind: CommandType::SubmitJob, code: 7, name: "SUBMIT_JOB", fields: &["function_name", "unique_id", "data"] },
    Descriptor { kind: CommandType::JobCreated, code: 8, name: "JOB_CREATED", fields: &["handle"] },
    Descriptor { kind: CommandType::GrabJob, code: 9, name: "GRAB_JOB", fields: &[] },
    Descriptor { kind: CommandType::NoJob, code: 10, name: "NO_JOB", fields: &[] },
    Descriptor { kind: CommandType::JobAssign, code: 11, name: "JOB_ASSIGN", fields: &["handle", "function_name", "data"] },
    Descriptor { kind: CommandType::WorkStatus, code: 12, name: "WORK_STATUS", fields: &["handle", "numerator", "denominator"] },
    Descriptor { kind: CommandType::WorkComplete, code: 13, name: "WORK_COMPLETE", fields: &["handle", "data"] },
    Descriptor { kind: CommandType::WorkFail, code: 14, name: "WORK_FAIL", fields: &["handle"] },
    Descriptor { kind: CommandType::GetStatus, code: 15, name: "GET_STATUS", fields: &["handle"] },
    Descriptor { kind: CommandType::EchoReq, code: 16, name: "ECHO_REQ", fields: &["data"] },
    Descriptor { kind: CommandType::EchoRes, code: 17, name: "ECHO_RES", fields: &["data"] },
    Descriptor { kind: CommandType::SubmitJobBg, code: 18, name: "SUBMIT_JOB_BG", fields: &["function_name", "unique_id", "data"] },
    Descriptor { kind: CommandType::Error, code: 19, name: "ERROR", fields: &["code", "text"] },
    Descriptor { kind: CommandType::StatusRes, code: 20, name: "STATUS_RES", fields: &["handle", "known", "running", "numerator", "denominator"] },
    Descriptor { kind: CommandType::SubmitJobHigh, code: 21, name: "SUBMIT_JOB_HIGH", fields: &["function_name", "unique_id", "data"] },
    Descriptor { kind: CommandType::WorkException, code: 25, name: "WORK_EXCEPTION", fields: &["handle", "data"] },
    Descriptor { kind: CommandType::OptionReq, code: 26, name: "OPTION_REQ", fields: &["option"] },
    Descriptor { kind: CommandType::OptionRes, code: 27, name: "OPTION_RES", fields: &["option"] },
    Descriptor { kind: CommandType::WorkData, code: 28, name: "WORK_DATA", fields: &["handle", "data"] },
    Descriptor { kind: CommandType::WorkWarning, code: 29, name: "WORK_WARNING", fields: &["handle", "data"] },
    Descriptor { kind: CommandType::GrabJobUniq, code: 30, name: "GRAB_JOB_UNIQ", fields: &[] },
    Descriptor { kind: CommandType::JobAssignUniq, code: 31, name: "JOB_ASSIGN_UNIQ", fields: &["handle", "function_name", "unique_id", "data"] },
    Descriptor { kind: CommandType::SubmitJobHighBg, code: 32, name: "SUBMIT_JOB_HIGH_BG", fields: &["function_name", "unique_id", "data"] },
    Descriptor { kind: CommandType::SubmitJobLow, code: 33, name: "SUBMIT_JOB_LOW", fields: &["function_name", "unique_id", "data"] },
    Descriptor { kind: CommandType::SubmitJobLowBg, code: 34, name: "SUBMIT_JOB_LOW_BG", fields: &["function_name", "unique_id", "data"] },
];

impl CommandType {
    /// Every command type in the catalog.
    pub fn all() -> impl Iterator<Item = CommandType> {
        CATALOG.iter().map(|d| d.kind)
    }

    fn descriptor(self) -> &'static Descriptor {
        CATALOG
            .iter()
            .find(|d| d.kind == self)
            .expect("every CommandType variant has a catalog entry")
    }

    /// The command's numeric wire code.
    pub fn code(self) -> u32 {
        self.descriptor().code
    }

    /// The command's protocol name, e.g. `SUBMIT_JOB`.
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// The ordered field schema. At most the last field is the opaque
    /// `data` field; all others are NUL-free strings on the wire.
    pub fn fields(self) -> &'static [&'static str] {
        self.descriptor().fields
    }

    /// Whether this command's final field carries opaque data.
    pub fn takes_data(self) -> bool {
        self.fields().last() == Some(&DATA_FIELD)
    }

    /// Look a command type up by wire code.
    pub fn from_code(code: u32) -> Option<CommandType> {
        CATALOG.iter().find(|d| d.code == code).map(|d| d.kind)
    }

    /// Look a command type up by protocol name.
    pub fn from_name(name: &str) -> Option<CommandType> {
        CATALOG.iter().find(|d| d.name == name).map(|d| d.kind)
    }
}

/// A single protocol command: magic, type, and the ordered argument values
/// of the type's field schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    magic: Magic,
    kind: CommandType,
    args: Vec<Bytes>,
}

impl Command {
    /// Build a request frame, validating `args` against the command's field
    /// schema.
    ///
    /// Every schema field must be supplied exactly once, no unknown fields
    /// may appear, and every field other than a trailing `data` field must
    /// be free of NUL bytes (NUL is the wire separator).
    pub fn request<'a, I>(kind: CommandType, args: I) -> Result<Command, Error>
    where
        I: IntoIterator<Item = (&'a str, Bytes)>,
    {
        Command::new(kind, Magic::Request, args)
    }

    /// Build a response frame. Same validation as [`Command::request`].
    pub fn response<'a, I>(kind: CommandType, args: I) -> Result<Command, Error>
    where
        I: IntoIterator<Item = (&'a str, Bytes)>,
    {
        Command::new(kind, Magic::Response, args)
    }

    /// Build a request frame from a command *name* rather than a type.
    ///
    /// Fails with [`Error::UnknownCommand`] for names outside the catalog,
    /// as distinct from the argument-mismatch failures of the typed
    /// constructors.
    pub fn request_named<'a, I>(name: &str, args: I) -> Result<Command, Error>
    where
        I: IntoIterator<Item = (&'a str, Bytes)>,
    {
        let kind =
            CommandType::from_name(name).ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        Command::new(kind, Magic::Request, args)
    }

    fn new<'a, I>(kind: CommandType, magic: Magic, args: I) -> Result<Command, Error>
    where
        I: IntoIterator<Item = (&'a str, Bytes)>,
    {
        let fields = kind.fields();
        let mut values: Vec<Option<Bytes>> = vec![None; fields.len()];
        for (name, value) in args {
            let pos = fields.iter().position(|f| *f == name).ok_or_else(|| {
                Error::Argument {
                    command: kind.name(),
                    message: format!("unknown field {name:?}"),
                }
            })?;
            if values[pos].is_some() {
                return Err(Error::Argument {
                    command: kind.name(),
                    message: format!("field {name:?} supplied twice"),
                });
            }
            if fields[pos] != DATA_FIELD && value.contains(&0) {
                return Err(Error::Argument {
                    command: kind.name(),
                    message: format!("field {name:?} contains a NUL byte"),
                });
            }
            values[pos] = Some(value);
        }

        let mut out = Vec::with_capacity(fields.len());
        for (field, value) in fields.iter().zip(values) {
            match value {
                Some(v) => out.push(v),
                None => {
                    return Err(Error::Argument {
                        command: kind.name(),
                        message: format!("missing field {field:?}"),
                    })
                }
            }
        }

        Ok(Command {
            magic,
            kind,
            args: out,
        })
    }

    /// Assemble a decoded frame. The codec has already matched the argument
    /// count against the schema.
    pub(crate) fn from_wire(magic: Magic, kind: CommandType, args: Vec<Bytes>) -> Command {
        debug_assert_eq!(args.len(), kind.fields().len());
        Command { magic, kind, args }
    }

    /// The frame's magic marker.
    pub fn magic(&self) -> Magic {
        self.magic
    }

    /// The frame's command type.
    pub fn kind(&self) -> CommandType {
        self.kind
    }

    /// The frame's command name, e.g. `WORK_COMPLETE`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// The ordered argument values, schema order.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The raw bytes of the named field, if the schema has it.
    pub fn arg(&self, name: &str) -> Option<&Bytes> {
        let pos = self.kind.fields().iter().position(|f| *f == name)?;
        self.args.get(pos)
    }

    /// The named field as UTF-8 text.
    pub fn arg_str(&self, name: &str) -> Result<&str, Error> {
        let bytes = self.arg(name).ok_or(Protocol::Malformed {
            command: self.kind.name(),
            error: "referenced field is not in the schema",
        })?;
        std::str::from_utf8(bytes).map_err(|_| {
            Protocol::Malformed {
                command: self.kind.name(),
                error: "field is not valid utf-8",
            }
            .into()
        })
    }

    /// The named field parsed as an unsigned integer.
    pub fn arg_u64(&self, name: &str) -> Result<u64, Error> {
        self.arg_str(name)?.parse().map_err(|_| {
            Protocol::Malformed {
                command: self.kind.name(),
                error: "field is not an unsigned integer",
            }
            .into()
        })
    }
}
