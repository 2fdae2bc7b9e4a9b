use thiserror::Error;

/// Failure surfaced by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("link error: {0}")]
    Link(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("delivery already settled")]
    AlreadySettled,
    #[error("settlement timed out")]
    Timeout,
    #[error("resource closed")]
    Closed,
    #[error("not supported by transport: {0}")]
    NotSupported(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }

    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Exit classification for this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::Argument(_) => ExitStatus::ArgumentError,
            Error::NotSupported(_) | Error::Transport(_) | Error::Other(_) => ExitStatus::OtherError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Outcome classification of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    ArgumentError,
    OtherError,
}

impl ExitStatus {
    /// Process exit code for this status.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::OtherError => 1,
            ExitStatus::ArgumentError => 2,
        }
    }
}
