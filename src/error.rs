//! Error types for daemon-link

use thiserror::Error;

use crate::connection::WireMessage;

/// Every failure the client can report.
///
/// Errors are `Clone` so that one teardown cause can be delivered to every
/// request it rejects and to every event subscriber.
#[derive(Error, Debug, Clone)]
pub enum DaemonError {
    #[error("No destination service for command: {0}")]
    UnknownDestination(String),

    #[error("Malformed message from daemon: {0}")]
    MalformedMessage(String),

    #[error("Service registration rejected: {0}")]
    HandshakeFailure(String),

    #[error("Connect timeout after {0}ms")]
    ConnectTimeout(u64),

    #[error("Request timeout after {timeout_ms}ms: {command}")]
    RequestTimeout { command: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Daemon reported failure for command: {}", .0.request.command)]
    RemoteFailure(Box<RemoteFailure>),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Client terminated")]
    Terminated,

    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Request id already outstanding: {0}")]
    DuplicateRequest(String),

    #[error("Disconnected while idle")]
    Idle,

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// The request and the full response of a call the daemon answered with
/// `success: false` (or without a success flag).
#[derive(Debug, Clone)]
pub struct RemoteFailure {
    pub request: WireMessage,
    pub response: WireMessage,
}

impl DaemonError {
    pub(crate) fn remote_failure(request: WireMessage, response: WireMessage) -> Self {
        Self::RemoteFailure(Box::new(RemoteFailure { request, response }))
    }

    /// The response payload attached to a remote failure, if this is one.
    pub fn response(&self) -> Option<&WireMessage> {
        match self {
            Self::RemoteFailure(failure) => Some(&failure.response),
            _ => None,
        }
    }
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;
