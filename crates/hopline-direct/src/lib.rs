//! # hopline direct
//!
//! Moving relayed traffic onto a direct peer-to-peer channel.
//!
//! This crate provides:
//! - [`MigrationConnection`], which tags application messages and switches
//!   them between the relayed path and a direct channel
//! - [`IceServerRegistry`], the bounded most-recent-first list of STUN
//!   servers offered to new direct-channel attempts
//!
//! ## Example
//!
//! ```rust,no_run
//! use hopline_direct::{IceServerRegistry, MigrationConnection};
//! use hopline_core::Duplex;
//!
//! # async fn run(relayed: Duplex) {
//! let (conn, mut app) = MigrationConnection::new(relayed, None);
//! app.sink.send(b"hello".to_vec()).await.unwrap();
//!
//! let registry = IceServerRegistry::default();
//! registry.on_public_node_discovered(&"/ip4/1.2.3.4/udp/3478".parse().unwrap());
//! let config = registry.snapshot();
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ice;
pub mod migration;

pub use ice::{IceConfig, IceServer, IceServerRegistry, MAX_STUN_SERVERS, stun_url};
pub use migration::{
    LengthPrefixedDecoder, MigrationConnection, MigrationState, encode_with_length_prefix,
};
