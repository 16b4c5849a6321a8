//! Capability interface of a direct peer-to-peer data channel.
//!
//! hopline never implements the channel itself (ICE negotiation, data channel
//! internals). It drives one through [`DirectChannel`] and observes it through
//! a stream of [`DirectEvent`]s.

use crate::error::DirectError;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle and data notifications from a direct channel
#[derive(Debug, Clone, PartialEq)]
pub enum DirectEvent {
    /// Channel is established and usable
    Connect,
    /// Inbound bytes (length-prefixed frames, possibly split or coalesced)
    Data(Vec<u8>),
    /// Handshake message to forward to the counterparty
    Signal(serde_json::Value),
    /// Channel failed
    Error(String),
    /// Channel closed by the remote side
    Close,
}

/// Outbound operations of a direct channel
pub trait DirectChannel: Send + Sync {
    /// Send bytes over the channel
    ///
    /// # Errors
    ///
    /// Returns [`DirectError`] if the channel is closed or the send fails.
    fn send(&self, data: Vec<u8>) -> Result<(), DirectError>;

    /// Feed a signalling message received from the counterparty
    ///
    /// # Errors
    ///
    /// Returns [`DirectError::Signal`] if the message is rejected.
    fn signal(&self, signal: serde_json::Value) -> Result<(), DirectError>;

    /// Tear the channel down. Must be idempotent.
    fn destroy(&self);
}

/// A channel together with its event stream
pub struct DirectHandle {
    /// Outbound side
    pub channel: Arc<dyn DirectChannel>,
    /// Inbound side
    pub events: mpsc::UnboundedReceiver<DirectEvent>,
}

impl DirectHandle {
    /// Bundle a channel with its events
    #[must_use]
    pub fn new(
        channel: Arc<dyn DirectChannel>,
        events: mpsc::UnboundedReceiver<DirectEvent>,
    ) -> Self {
        Self { channel, events }
    }
}

impl std::fmt::Debug for DirectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectHandle").finish_non_exhaustive()
    }
}

/// Creates fresh inbound channel attempts, e.g. after a relay stream switch
pub trait DirectUpgrader: Send + Sync {
    /// Start a new inbound direct-channel attempt
    fn upgrade_inbound(&self) -> DirectHandle;
}
