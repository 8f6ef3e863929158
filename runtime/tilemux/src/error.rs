//! Error codes
//!
//! Every operation of the core reports failure as a [`Code`]. The numeric
//! values are stable because they travel in reply messages; [`Error`] adds a
//! short static context for logging.

use tcu::TcuError;
use thiserror::Error;

/// Result codes carried in replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum Code {
    #[error("success")]
    Success = 0,

    #[error("invalid arguments")]
    InvArgs = 1,

    #[error("out of memory")]
    OutOfMem = 2,

    #[error("no space left")]
    NoSpace = 3,

    #[error("already exists")]
    Exists = 4,

    #[error("missing credits")]
    MissCredits = 5,

    #[error("operation aborted")]
    Abort = 6,

    #[error("activity gone")]
    ActGone = 7,

    #[error("no permission")]
    NoPerm = 8,

    #[error("not supported")]
    NotSup = 9,

    #[error("receive gate gone")]
    RecvGone = 10,

    #[error("no kernel memory")]
    NoKmem = 11,

    #[error("invalid endpoint")]
    EpInvalid = 12,

    #[error("would block")]
    WouldBlock = 13,
}

impl Code {
    /// Decode a raw reply value; unknown values are treated as `InvArgs`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Code::Success,
            1 => Code::InvArgs,
            2 => Code::OutOfMem,
            3 => Code::NoSpace,
            4 => Code::Exists,
            5 => Code::MissCredits,
            6 => Code::Abort,
            7 => Code::ActGone,
            8 => Code::NoPerm,
            9 => Code::NotSup,
            10 => Code::RecvGone,
            11 => Code::NoKmem,
            12 => Code::EpInvalid,
            13 => Code::WouldBlock,
            _ => Code::InvArgs,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Failure of a core operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} ({context})")]
pub struct Error {
    code: Code,
    context: &'static str,
}

impl Error {
    pub const fn new(code: Code, context: &'static str) -> Self {
        Self { code, context }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn context(&self) -> &'static str {
        self.context
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self::new(code, "-")
    }
}

impl From<TcuError> for Error {
    fn from(e: TcuError) -> Self {
        match e {
            TcuError::InvalidEp { .. } => Self::new(Code::InvArgs, "no such endpoint"),
            TcuError::NoSep { .. } => Self::new(Code::InvArgs, "not a send endpoint"),
            TcuError::ForeignEp { .. } => Self::new(Code::NoPerm, "endpoint of another activity"),
            TcuError::NoCredits { .. } => Self::new(Code::MissCredits, "no credits left"),
            TcuError::Busy { .. } => Self::new(Code::Abort, "endpoint has messages in flight"),
            TcuError::BadRegs { .. } => Self::new(Code::EpInvalid, "malformed endpoint registers"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
