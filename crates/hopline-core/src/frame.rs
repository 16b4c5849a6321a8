//! Relay sub-protocol framing.
//!
//! Every unit on a relayed stream is `[prefix][body]`. The prefix selects one
//! of four channels multiplexed over the same physical stream, and also gives
//! the scheduling priority used by the status queue:
//!
//! ```text
//! CONNECTION_STATUS > STATUS_MESSAGE > WEBRTC_SIGNALLING > PAYLOAD
//! ```
//!
//! `CONNECTION_STATUS` and `STATUS_MESSAGE` carry a single code byte as their
//! body. `WEBRTC_SIGNALLING` carries a UTF-8 JSON object.

use crate::error::FrameError;
use std::cmp::Ordering;

/// Relay channel prefix. Lower discriminant means higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Prefix {
    /// Stop / restart control
    ConnectionStatus = 0x00,
    /// Liveness probes
    StatusMessage = 0x01,
    /// Out-of-band direct channel handshake
    WebRtcSignalling = 0x02,
    /// Application bytes
    Payload = 0x03,
}

impl TryFrom<u8> for Prefix {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::ConnectionStatus),
            0x01 => Ok(Self::StatusMessage),
            0x02 => Ok(Self::WebRtcSignalling),
            0x03 => Ok(Self::Payload),
            _ => Err(FrameError::InvalidPrefix(value)),
        }
    }
}

/// Codes valid under [`Prefix::ConnectionStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Terminate the relayed connection
    Stop = 0x00,
    /// Underlying stream was replaced, reconnect
    Restart = 0x01,
}

impl TryFrom<u8> for ConnectionStatus {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Stop),
            0x01 => Ok(Self::Restart),
            _ => Err(FrameError::InvalidConnectionStatus(value)),
        }
    }
}

/// Codes valid under [`Prefix::StatusMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusMessage {
    /// Liveness probe
    Ping = 0x00,
    /// Probe answer
    Pong = 0x01,
}

impl TryFrom<u8> for StatusMessage {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Ping),
            0x01 => Ok(Self::Pong),
            _ => Err(FrameError::InvalidStatusCode(value)),
        }
    }
}

/// Leading byte added by the migration wrapper, orthogonal to [`Prefix`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MigrationTag {
    /// Sender has not switched to the direct channel
    NotDone = 0x00,
    /// Sender's direct channel is ready
    Done = 0x01,
}

impl TryFrom<u8> for MigrationTag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::NotDone),
            0x01 => Ok(Self::Done),
            _ => Err(FrameError::InvalidMigrationTag(value)),
        }
    }
}

/// Returns `true` if `byte` is one of the four relay prefixes
#[must_use]
pub fn is_valid_prefix(byte: u8) -> bool {
    Prefix::try_from(byte).is_ok()
}

/// Scheduling order of two framed messages.
///
/// `Less` means `a` goes out first. Frames with an unknown or missing prefix
/// sort after every valid one.
#[must_use]
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    let rank = |frame: &[u8]| {
        frame
            .first()
            .and_then(|byte| Prefix::try_from(*byte).ok())
            .map_or(u8::MAX, |prefix| prefix as u8)
    };

    rank(a).cmp(&rank(b))
}

/// Frame constructors
pub struct Frame;

impl Frame {
    /// `[CONNECTION_STATUS, STOP]`
    #[must_use]
    pub fn stop() -> Vec<u8> {
        vec![Prefix::ConnectionStatus as u8, ConnectionStatus::Stop as u8]
    }

    /// `[CONNECTION_STATUS, RESTART]`
    #[must_use]
    pub fn restart() -> Vec<u8> {
        vec![Prefix::ConnectionStatus as u8, ConnectionStatus::Restart as u8]
    }

    /// `[STATUS_MESSAGE, PING]`
    #[must_use]
    pub fn ping() -> Vec<u8> {
        vec![Prefix::StatusMessage as u8, StatusMessage::Ping as u8]
    }

    /// `[STATUS_MESSAGE, PONG]`
    #[must_use]
    pub fn pong() -> Vec<u8> {
        vec![Prefix::StatusMessage as u8, StatusMessage::Pong as u8]
    }

    /// `[PAYLOAD, ..data]`
    #[must_use]
    pub fn payload(data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(Prefix::Payload as u8);
        frame.extend_from_slice(data);
        frame
    }

    /// `[WEBRTC_SIGNALLING, ..json]`
    #[must_use]
    pub fn signalling(signal: &serde_json::Value) -> Vec<u8> {
        let mut frame = vec![Prefix::WebRtcSignalling as u8];
        frame.extend_from_slice(signal.to_string().as_bytes());
        frame
    }

    /// Returns `true` if `frame` is exactly a STOP
    #[must_use]
    pub fn is_stop(frame: &[u8]) -> bool {
        frame == [Prefix::ConnectionStatus as u8, ConnectionStatus::Stop as u8]
    }

    /// Split a raw frame into its prefix and body
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Empty`] for a zero-length frame and
    /// [`FrameError::InvalidPrefix`] for an unknown leading byte.
    pub fn parse(frame: &[u8]) -> Result<(Prefix, &[u8]), FrameError> {
        let (&first, body) = frame.split_first().ok_or(FrameError::Empty)?;
        Ok((Prefix::try_from(first)?, body))
    }
}

/// Decode a `WEBRTC_SIGNALLING` body
///
/// # Errors
///
/// Returns [`FrameError::MalformedSignal`] if the body is not valid UTF-8 JSON.
pub fn decode_signal(body: &[u8]) -> Result<serde_json::Value, FrameError> {
    serde_json::from_slice(body).map_err(|e| FrameError::MalformedSignal(e.to_string()))
}
