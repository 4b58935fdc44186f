use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("already present in cachetable")]
    AlreadyPresent,
    #[error("operation must be retried from the top")]
    TryAgain,
    #[error("I/O error")]
    IOError,
    #[error("cachefile is closing")]
    FileClosing,
    #[error("insufficient memory({0})")]
    InsufficientMemory(usize),
    #[error("channel send error")]
    SendError,
    #[error("invalid state")]
    InvalidState,
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(_src: std::io::Error) -> Self {
        Error::IOError
    }
}
