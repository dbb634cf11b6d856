//! Client-visible error taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{SessionId, UpstreamError};

/// Error kind, stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotFound,
    CapacityExceeded,
    ConnectionUnavailable,
    TransientUpstreamError,
    PermanentUpstreamError,
    RequestTimeout,
    InvalidRequest,
}

/// Session operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid or expired session: {0}. Create a new session first.")]
    SessionNotFound(String),
    #[error("Session capacity reached ({max} active sessions); retry later")]
    CapacityExceeded { max: usize },
    #[error("Upstream connection unavailable after {attempts} attempt(s): {reason}; retry later")]
    ConnectionUnavailable { attempts: u32, reason: String },
    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("Upstream error: {0}")]
    PermanentUpstream(String),
    #[error("Request timed out after {}s", .0.as_secs_f64())]
    RequestTimeout(Duration),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SessionError {
    /// Shorthand for an unknown session.
    #[must_use]
    pub fn not_found(id: SessionId) -> Self {
        Self::SessionNotFound(id.to_string())
    }

    /// Wire-level kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            Self::TransientUpstream(_) => ErrorKind::TransientUpstreamError,
            Self::PermanentUpstream(_) => ErrorKind::PermanentUpstreamError,
            Self::RequestTimeout(_) => ErrorKind::RequestTimeout,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the client may reasonably retry the same call later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::ConnectionUnavailable { .. }
                | Self::TransientUpstream(_)
                | Self::RequestTimeout(_)
        )
    }

    /// Whether the facade may retry internally.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }
}

impl From<UpstreamError> for SessionError {
    fn from(err: UpstreamError) -> Self {
        if err.is_transient() {
            Self::TransientUpstream(err.to_string())
        } else {
            Self::PermanentUpstream(err.to_string())
        }
    }
}

/// Parse a client-supplied session id.
///
/// # Errors
/// Malformed ids are reported as unknown sessions, since no session can
/// carry them.
pub fn parse_session_id(raw: &str) -> Result<SessionId, SessionError> {
    raw.trim()
        .parse()
        .map_err(|_| SessionError::SessionNotFound(raw.to_string()))
}
