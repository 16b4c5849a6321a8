//! Error types shared by the hopline crates.

use thiserror::Error;

/// Per-frame decoding errors.
///
/// None of these are fatal: the loops that see them log the frame and drop it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame carried no bytes at all
    #[error("empty frame")]
    Empty,

    /// Unknown relay prefix byte
    #[error("invalid prefix: 0x{0:02X}")]
    InvalidPrefix(u8),

    /// Unknown code under `CONNECTION_STATUS`
    #[error("invalid connection status code: 0x{0:02X}")]
    InvalidConnectionStatus(u8),

    /// Unknown code under `STATUS_MESSAGE`
    #[error("invalid status message code: 0x{0:02X}")]
    InvalidStatusCode(u8),

    /// Unknown migration tag
    #[error("invalid migration tag: 0x{0:02X}")]
    InvalidMigrationTag(u8),

    /// Signalling body could not be decoded as JSON
    #[error("malformed signalling message: {0}")]
    MalformedSignal(String),
}

/// Status queue errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `pop` on an empty queue. Always a bug in the caller.
    #[error("status message queue is empty")]
    Empty,
}

/// Errors raised by the relay state machines.
///
/// These indicate the state machine reached an impossible state and are
/// surfaced to whoever owns the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Status queue invariant broken
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// An awaited race produced no result where one was required
    #[error("unexpected done result in {0}")]
    UnexpectedDone(&'static str),

    /// The underlying stream went away
    #[error("underlying stream closed")]
    StreamClosed,

    /// The outgoing source was already handed out
    #[error("source already taken")]
    SourceTaken,
}

/// Direct channel errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectError {
    /// Channel already destroyed or not yet connected
    #[error("direct channel closed")]
    Closed,

    /// Outbound send failed
    #[error("direct channel send failed: {0}")]
    Send(String),

    /// Signal could not be applied
    #[error("direct channel signal failed: {0}")]
    Signal(String),
}

/// Address parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// Unsupported or malformed protocol component
    #[error("invalid address: {0}")]
    Invalid(String),

    /// Peer identifier is not 32 hex-encoded bytes
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
