//! Transport layer for the option market data gateway.
//!
//! Provides:
//! - Wire protocol (JSON tool calls)
//! - `Dispatcher` mapping tool calls onto the session facade
//! - HTTP and WebSocket routes (feature: http)

pub mod dispatch;
pub mod protocol;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub mod websocket;

pub use dispatch::Dispatcher;
#[cfg(feature = "http")]
pub use http::create_router;
pub use protocol::{ErrorBody, RpcRequest, RpcResponse, ToolCall};
