//! Error types for the session engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the engine can report.
///
/// Variants carry rendered messages rather than source errors so that a
/// terminal cause can be stored on a session and handed back verbatim to
/// every later caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid app state: {0}")]
    InvalidAppState(String),

    #[error("Session expired: {0}")]
    AuthExpired(String),

    #[error("Parse failure: {0}")]
    ParseFailure(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Event queue overflow: {0}")]
    Overflow(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("An event listener is already registered")]
    ListenerAlreadyRegistered,

    #[error("Already listening")]
    AlreadyListening,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable error classification, used inside events and status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidAppState,
    AuthExpired,
    ParseFailure,
    NetworkError,
    Overflow,
    ProtocolError,
    Timeout,
    NotConnected,
    ListenerAlreadyRegistered,
    AlreadyListening,
    Config,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAppState(_) => ErrorKind::InvalidAppState,
            Self::AuthExpired(_) => ErrorKind::AuthExpired,
            Self::ParseFailure(_) => ErrorKind::ParseFailure,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::ListenerAlreadyRegistered => ErrorKind::ListenerAlreadyRegistered,
            Self::AlreadyListening => ErrorKind::AlreadyListening,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors that end a session unless something recovers it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidAppState(_) | Self::AuthExpired(_))
    }

    /// Auth-class failures wake the session guardian.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    /// Transient failures the stream manager absorbs with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Protocol(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ParseFailure(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("IO error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::AuthExpired("login".into()).is_fatal());
        assert!(Error::AuthExpired("login".into()).is_auth());
        assert!(Error::InvalidAppState("no uid".into()).is_fatal());
        assert!(!Error::InvalidAppState("no uid".into()).is_auth());
        assert!(!Error::Network("reset".into()).is_fatal());
        assert!(Error::Network("reset".into()).is_transient());
        assert!(!Error::ParseFailure("x".into()).is_transient());
    }

    #[test]
    fn test_kind_serializes_camel_case() {
        let json = serde_json::to_string(&Error::Network("x".into()).kind()).unwrap();
        assert_eq!(json, "\"networkError\"");
        let json = serde_json::to_string(&ErrorKind::InvalidAppState).unwrap();
        assert_eq!(json, "\"invalidAppState\"");
    }

    #[test]
    fn test_json_error_is_parse_failure() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::ParseFailure);
    }
}
