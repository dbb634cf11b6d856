//! Core abstractions for the session-based option market data gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionError` - Typed error taxonomy surfaced to clients
//! - `SessionConfig` / `GatewayConfig` - Lifecycle and upstream settings
//! - `OptionChain` and friends - Opaque market data returned by sources
//! - `Clock` - Injectable time source for expiry decisions
//! - `MarketDataSource` and `SourceFactory` traits

pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod market;
pub mod traits;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{GatewayConfig, MarketDataMode, ReconnectConfig, ReconnectPolicy, SessionConfig};
pub use error::{ErrorKind, SessionError};
pub use market::{ChainRequest, OptionChain, OptionContract, OptionRight, PriceQuote};
pub use traits::{
    ConnectParams, ConnectionState, MarketDataSource, SessionId, SessionStatus, SourceFactory,
    UpstreamError,
};
