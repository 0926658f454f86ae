//! Error types for AgentDock Core

use serde::Serialize;
use thiserror::Error;

/// Main error type for AgentDock operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Agent directory scanning errors
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Agents directory unreadable: {path}: {reason}")]
    RootUnreadable { path: String, reason: String },
}

/// Session lookup and creation errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("No driver registered for agent kind: {0}")]
    UnsupportedKind(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Runtime driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to start agent: {0}")]
    StartFailed(String),

    #[error("Message delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Teardown failed: {0}")]
    TeardownFailed(String),
}

/// Machine-checkable error category exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Scan,
    UnknownAgent,
    UnsupportedKind,
    DriverStartFailed,
    DeliveryFailed,
    SessionNotFound,
    TeardownFailed,
    Config,
    Internal,
}

impl Error {
    /// Category of this error, stable across message wording changes
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Scan(_) => ErrorKind::Scan,
            Error::Session(SessionError::UnknownAgent(_)) => ErrorKind::UnknownAgent,
            Error::Session(SessionError::UnsupportedKind(_)) => ErrorKind::UnsupportedKind,
            Error::Session(SessionError::NotFound(_)) => ErrorKind::SessionNotFound,
            Error::Driver(DriverError::StartFailed(_)) => ErrorKind::DriverStartFailed,
            Error::Driver(DriverError::DeliveryFailed(_)) => ErrorKind::DeliveryFailed,
            Error::Driver(DriverError::TeardownFailed(_)) => ErrorKind::TeardownFailed,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn start_failed(msg: impl Into<String>) -> Self {
        Error::Driver(DriverError::StartFailed(msg.into()))
    }

    pub(crate) fn delivery_failed(msg: impl Into<String>) -> Self {
        Error::Driver(DriverError::DeliveryFailed(msg.into()))
    }

    pub(crate) fn teardown_failed(msg: impl Into<String>) -> Self {
        Error::Driver(DriverError::TeardownFailed(msg.into()))
    }

    pub(crate) fn session_not_found(id: impl Into<String>) -> Self {
        Error::Session(SessionError::NotFound(id.into()))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::session_not_found("abc").kind(),
            ErrorKind::SessionNotFound
        );
        assert_eq!(
            Error::Session(SessionError::UnknownAgent("x".into())).kind(),
            ErrorKind::UnknownAgent
        );
        assert_eq!(Error::delivery_failed("boom").kind(), ErrorKind::DeliveryFailed);
        assert_eq!(Error::teardown_failed("boom").kind(), ErrorKind::TeardownFailed);
    }

    #[test]
    fn test_error_serializes_kind_and_message() {
        let err = Error::start_failed("docker build exited with 1");
        let json = serde_json::to_value(&err).unwrap();

        assert_eq!(json["kind"], "driver_start_failed");
        assert_eq!(
            json["message"],
            "Driver error: Failed to start agent: docker build exited with 1"
        );
    }
}
