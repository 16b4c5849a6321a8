//! # hopline relay
//!
//! The relay sub-protocol of hopline: both ends of a relayed stream.
//!
//! This crate provides:
//! - [`RelayConnection`], the client-side connection multiplexing payload,
//!   liveness probes, control and direct-channel signalling over one stream
//! - [`RelayContext`], the relay-side forwarding state that answers probes,
//!   surfaces stream replacement as RESTART and bridges two clients
//!
//! ## Example
//!
//! ```rust,no_run
//! use hopline_core::{Duplex, RelayConfig};
//! use hopline_relay::RelayContext;
//!
//! # async fn run(a: Duplex, b: Duplex) {
//! let config = RelayConfig::default();
//! let ctx_a = RelayContext::new(a, &config);
//! let ctx_b = RelayContext::new(b, &config);
//! RelayContext::pair(&ctx_a, &ctx_b).unwrap();
//!
//! let latency = ctx_a.ping(None).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod context;
mod signal;

pub use connection::{
    DirectUpgrade, ReconnectFuture, ReconnectHandler, RelayConnection, RelayConnectionOptions,
    Timeline,
};
pub use context::{ContextEvent, RelayContext};
