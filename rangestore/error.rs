use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The key could not be mapped to a range server. Raised before any
    /// message is sent.
    #[error("unable to route key: {0}")]
    Routing(String),

    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("request of {count} records exceeds the maximum of {max}")]
    TooManyRecords { count: usize, max: usize },

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("manifest mismatch: {0}")]
    Manifest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rank {rank} does not serve index {index}")]
    NotServing { rank: u32, index: u32 },

    #[error("unknown index {0}")]
    UnknownIndex(u32),

    #[error("store is closed")]
    Closed,
}

/// Status carried on the wire in every receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    Error,
    DbError,
    NotFound,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::Error => -1,
            ErrorCode::DbError => -2,
            ErrorCode::NotFound => -3,
        }
    }

    pub fn from_code(code: i32) -> ErrorCode {
        match code {
            0 => ErrorCode::Success,
            -2 => ErrorCode::DbError,
            -3 => ErrorCode::NotFound,
            _ => ErrorCode::Error,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> ErrorCode {
        match e {
            Error::Storage(_) => ErrorCode::DbError,
            _ => ErrorCode::Error,
        }
    }
}
