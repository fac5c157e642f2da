use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("not my vbucket")]
    NotMyVbucket,

    #[error("key not found")]
    KeyNotFound,

    #[error("key exists")]
    KeyExists,

    #[error("temporary failure")]
    TempFail,

    #[error("operation would block")]
    WouldBlock,

    #[error("out of memory")]
    OutOfMemory,

    #[error("not stored")]
    NotStored,

    #[error("connection should be disconnected")]
    Disconnect,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown configuration parameter: {0}")]
    UnknownParameter(String),

    #[error("system shutting down")]
    ShuttingDown,

    #[error("mutation log is corrupted: {0}")]
    CorruptedLog(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DriftError>;

impl DriftError {
    /// True for conditions a client is expected to retry, either
    /// immediately (TempFail) or after an I/O completion notification
    /// (WouldBlock).
    pub fn is_transient(&self) -> bool {
        matches!(self, DriftError::TempFail | DriftError::WouldBlock)
    }
}
