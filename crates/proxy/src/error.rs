//! Error types for the proxy.

use crate::jsonrpc::{self, RequestId};
use axum::http::StatusCode;
use std::time::Duration;

/// Proxy error type.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The container is not known to the registration store.
    #[error("container '{0}' not found")]
    UnknownContainer(String),

    /// The container exists but has no server registered under this name.
    #[error("server '{server_name}' is not registered for container '{container_id}'")]
    UnknownServer {
        container_id: String,
        server_name: String,
    },

    /// No live session with this id.
    #[error("session '{0}' not found")]
    UnknownSession(String),

    /// The subprocess could not be started.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the subprocess stdin failed.
    #[error("failed to write to subprocess stdin: {0}")]
    Write(#[source] std::io::Error),

    /// The subprocess exited or closed its stdout.
    #[error("subprocess closed: {0}")]
    BridgeClosed(String),

    /// A request id is already pending (or was already used) on the session.
    #[error("request id {0} is already in use on this session")]
    DuplicateRequestId(RequestId),

    /// No reply arrived within the call budget.
    #[error("timed out after {}s waiting for the subprocess to reply", .0.as_secs_f64())]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status the gateway answers with when this error ends a call.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::UnknownContainer(_) | Self::UnknownServer { .. } | Self::UnknownSession(_) => {
                StatusCode::NOT_FOUND
            }
            Self::DuplicateRequestId(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_)
            | Self::Spawn { .. }
            | Self::Write(_)
            | Self::BridgeClosed(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code carried in the error object for this error.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::DuplicateRequestId(_) => jsonrpc::INVALID_REQUEST,
            _ => jsonrpc::INTERNAL_ERROR,
        }
    }

    /// Whether the session that produced this error can no longer be used.
    #[must_use]
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Self::Write(_) | Self::BridgeClosed(_))
    }
}

/// Result type alias using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;
