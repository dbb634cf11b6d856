//! Session lifecycle management for the option market data gateway.
//!
//! Provides:
//! - `UpstreamConnection` - One broker connection with bounded reconnection
//! - `Session` / `SessionRegistry` - Session handles and their owner
//! - `IdleReaper` - Background expiry of idle sessions
//! - `SessionFacade` - The operation surface used by transports

pub mod connection;
pub mod facade;
pub mod reaper;
pub mod registry;
pub mod session;
#[cfg(feature = "simulated")]
pub mod simulated;

pub use connection::UpstreamConnection;
pub use facade::{HealthReport, SessionFacade, SessionHealth, SessionStats};
pub use reaper::{IdleReaper, ReapReport, ReaperHandle};
pub use registry::SessionRegistry;
pub use session::{Session, SessionSummary};
#[cfg(feature = "simulated")]
pub use simulated::SimulatedMarket;
