//! Culvert Bridge Library
//!
//! Async client for the Culvert backend daemon: the Unix socket channel,
//! delivery acknowledgment tracking, outbound rate limiting, and the
//! transport tunnel lifecycle.
//!
//! # Architecture
//!
//! - **Bridge**: cloneable handle the embedding layer drives
//! - **Channel**: newline-framed JSON over a Unix socket, auto-reconnecting
//! - **Transport**: direct socket, or routed through the mesh tunnel daemon
//!
//! # Usage
//!
//! ```ignore
//! let (bridge, mut events) = Bridge::new(BridgeConfig::default());
//!
//! // Join a room; connects first if the channel is down
//! bridge.join("lobby", pre_key_bundle).await?;
//!
//! // Process events
//! while let Some(event) = events.recv().await {
//!     match event {
//!         BridgeEvent::MessageReceived(envelope) => { /* hand to the UI */ }
//!         BridgeEvent::StatusChanged(state) => { /* update indicator */ }
//!         BridgeEvent::BackendError(error) => { /* surface it */ }
//!     }
//! }
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
mod connection;
pub mod delivery;
pub mod error;
#[cfg(test)]
pub(crate) mod harness;
pub mod limiter;
pub mod tunnel;

pub use backend::BackendProcess;
pub use bridge::{Bridge, BridgeEvent, ConnectionState};
pub use config::{BackendConfig, BridgeConfig, ConfigError, RateLimit, TunnelConfig};
pub use delivery::{DeliveryReceipt, DeliveryStatus, DeliveryTracker};
pub use error::{Error, Result};
pub use limiter::RateLimiter;
pub use tunnel::TunnelRuntime;

pub use culvert_proto::{Command, Event, TransportMode};
