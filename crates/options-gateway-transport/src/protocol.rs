//! Wire protocol for tool calls.

use options_gateway_core::{ErrorKind, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ToolCall {
    /// Open a new session.
    CreateSession,
    /// Current price of an underlying.
    GetUnderlyingPrice { session_id: String, symbol: String },
    /// Option chain of an underlying.
    FetchOptionChain {
        session_id: String,
        symbol: String,
        /// Falls back to the server's default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strike_count: Option<u32>,
        #[serde(default)]
        expiration_days: Vec<u32>,
    },
    /// Close a session.
    DeleteSession { session_id: String },
    /// Registry snapshot.
    GetSessionStats,
    /// Server health, optionally with one session's.
    HealthCheck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ToolCall {
    /// Method name as it appears on the wire.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CreateSession => "create_session",
            Self::GetUnderlyingPrice { .. } => "get_underlying_price",
            Self::FetchOptionChain { .. } => "fetch_option_chain",
            Self::DeleteSession { .. } => "delete_session",
            Self::GetSessionStats => "get_session_stats",
            Self::HealthCheck { .. } => "health_check",
        }
    }
}

/// Request envelope: `{"id": 1, "method": "...", ...params}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub call: ToolCall,
}

impl RpcRequest {
    /// Parse a request from JSON text.
    ///
    /// On failure the id is still recovered when the text was a JSON object
    /// carrying one, so the error can be correlated.
    ///
    /// # Errors
    /// Returns the recovered id and an `InvalidRequest` error.
    pub fn parse(text: &str) -> Result<Self, (Option<u64>, SessionError)> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| (None, SessionError::InvalidRequest(format!("malformed JSON: {e}"))))?;
        let id = value.get("id").and_then(Value::as_u64);
        serde_json::from_value(value).map_err(|e| (id, SessionError::InvalidRequest(e.to_string())))
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&SessionError> for ErrorBody {
    fn from(err: &SessionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Response envelope carrying either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    #[must_use]
    pub const fn success(id: Option<u64>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Option<u64>, err: &SessionError) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.into()),
        }
    }

    /// Build from an operation outcome.
    #[must_use]
    pub fn from_result(id: Option<u64>, result: Result<Value, SessionError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, &err),
        }
    }
}
