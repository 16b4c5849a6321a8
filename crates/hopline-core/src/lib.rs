//! # hopline core
//!
//! Shared building blocks of the hopline relay transport.
//!
//! This crate provides:
//! - The relay frame taxonomy and its priority order
//! - The status queue used by both relay state machines
//! - Message-oriented duplex streams
//! - Peer ids and relay-hop addresses
//! - The direct-channel capability interface
//! - Configuration and error types
//!
//! ## Wire format
//!
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ prefix │ body                         │
//! │ 1 byte │ N bytes                      │
//! └────────┴──────────────────────────────┘
//!   0x00 CONNECTION_STATUS  body = STOP (0x00) | RESTART (0x01)
//!   0x01 STATUS_MESSAGE     body = PING (0x00) | PONG (0x01)
//!   0x02 WEBRTC_SIGNALLING  body = UTF-8 JSON
//!   0x03 PAYLOAD            body = application bytes
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod config;
pub mod direct;
pub mod error;
pub mod frame;
pub mod queue;
pub mod stream;

pub use addr::{PeerAddr, PeerId, Protocol};
pub use config::{HoplineConfig, IceSettings, RelayConfig};
pub use direct::{DirectChannel, DirectEvent, DirectHandle, DirectUpgrader};
pub use error::{AddrError, ConfigError, DirectError, FrameError, QueueError, RelayError};
pub use frame::{
    ConnectionStatus, Frame, MigrationTag, Prefix, StatusMessage, compare, decode_signal,
    is_valid_prefix,
};
pub use queue::StatusQueue;
pub use stream::Duplex;
