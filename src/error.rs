//! Error taxonomy shared by every component of the session core.

use crate::session::SessionState;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend unreachable, TLS handshake or certificate failure.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Mid-session drop after the reconnect budget was spent.
    #[error("connection lost after {attempts} attempts: {reason}")]
    ConnectionLost { attempts: u32, reason: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Local checksum/wordlist failure. Never reaches the network.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("{operation} not allowed while {state}")]
    InvalidState { operation: &'static str, state: SessionState },
    #[error("query failed: {0}")]
    Query(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("no valid fee estimate for any bucket")]
    FeeDataUnavailable,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Persisted wallet state could not be read or written.
    #[error("storage: {0}")]
    Storage(String),
}

/// Discriminant of [`Error`] for callers that branch on kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    ConnectionLost,
    Authentication,
    InvalidMnemonic,
    InvalidState,
    Query,
    Timeout,
    FeeDataUnavailable,
    InvalidConfig,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::InvalidMnemonic(_) => ErrorKind::InvalidMnemonic,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::Query(_) => ErrorKind::Query,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::FeeDataUnavailable => ErrorKind::FeeDataUnavailable,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        Error::InvalidState { operation, state }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
