//! Maps tool calls onto the session facade.

use options_gateway_core::{ChainRequest, SessionError, market::DEFAULT_STRIKE_COUNT};
use options_gateway_session::SessionFacade;
use serde_json::{Value, json};

use crate::protocol::{RpcRequest, RpcResponse, ToolCall};

/// Executes tool calls and shapes their results.
#[derive(Clone)]
pub struct Dispatcher {
    facade: SessionFacade,
    default_strike_count: u32,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(facade: SessionFacade) -> Self {
        Self {
            facade,
            default_strike_count: DEFAULT_STRIKE_COUNT,
        }
    }

    /// Strike count used when a chain request leaves it out.
    #[must_use]
    pub const fn with_default_strike_count(mut self, strike_count: u32) -> Self {
        self.default_strike_count = strike_count;
        self
    }

    #[must_use]
    pub const fn facade(&self) -> &SessionFacade {
        &self.facade
    }

    /// Handle one raw request text.
    pub async fn handle_text(&self, text: &str) -> RpcResponse {
        match RpcRequest::parse(text) {
            Ok(request) => self.handle(request).await,
            Err((id, err)) => {
                tracing::debug!(error = %err, "Rejected malformed request");
                RpcResponse::failure(id, &err)
            }
        }
    }

    /// Handle one parsed request.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let method = request.call.method();
        let result = self.dispatch(request.call).await;
        if let Err(err) = &result {
            tracing::warn!(method, kind = ?err.kind(), error = %err, "Tool call failed");
        }
        RpcResponse::from_result(request.id, result)
    }

    /// Run a call and return its JSON result.
    ///
    /// # Errors
    /// Returns the facade's error for the call.
    pub async fn dispatch(&self, call: ToolCall) -> Result<Value, SessionError> {
        match call {
            ToolCall::CreateSession => {
                let id = self.facade.create_session().await?;
                let timeout = self.facade.registry().config().session_timeout;
                Ok(json!({
                    "session_id": id,
                    "timeout_secs": timeout.as_secs(),
                    "message": format!(
                        "Session created. Pass session_id to subsequent calls; it expires after {} minutes of inactivity.",
                        timeout.as_secs() / 60
                    ),
                }))
            }
            ToolCall::GetUnderlyingPrice { session_id, symbol } => {
                let quote = self.facade.get_underlying_price(&session_id, &symbol).await?;
                let message = format!("Current price of {}: ${:.2}", quote.symbol, quote.price);
                Ok(with_message(json!(quote), message))
            }
            ToolCall::FetchOptionChain {
                session_id,
                symbol,
                strike_count,
                expiration_days,
            } => {
                let request = ChainRequest::new(&symbol)?
                    .with_strike_count(strike_count.unwrap_or(self.default_strike_count))
                    .with_expiration_days(expiration_days);
                let chain = self.facade.fetch_option_chain(&session_id, request).await?;
                let message = format!(
                    "Fetched {} option contracts for {} ({} calls, {} puts)",
                    chain.total_contracts, chain.symbol, chain.calls, chain.puts
                );
                Ok(with_message(json!(chain), message))
            }
            ToolCall::DeleteSession { session_id } => {
                let existed = self.facade.delete_session(&session_id).await;
                let message = if existed {
                    format!("Session {session_id} closed")
                } else {
                    format!("Session {session_id} was not open")
                };
                Ok(json!({ "ok": true, "existed": existed, "message": message }))
            }
            ToolCall::GetSessionStats => Ok(json!(self.facade.stats().await)),
            ToolCall::HealthCheck { session_id } => {
                Ok(json!(self.facade.health_check(session_id.as_deref()).await))
            }
        }
    }
}

fn with_message(mut value: Value, message: String) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("message".into(), Value::String(message));
    }
    value
}
