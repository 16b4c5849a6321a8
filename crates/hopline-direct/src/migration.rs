//! Relayed-to-direct migration wrapper.
//!
//! [`MigrationConnection`] sits between the application and a relayed stream
//! and moves traffic onto a direct channel once one is usable. Every
//! application message carries one leading [`MigrationTag`] byte on both
//! paths. Over the direct channel, tagged messages are additionally length
//! prefixed:
//!
//! ```text
//! relayed:  [tag][payload]
//! direct:   [len: u32 BE][tag][payload]
//! control:  [DONE]                      (relayed only, zero-length payload)
//! ```
//!
//! The wrapper starts `Relayed`. A `Connect` event or an inbound DONE moves it
//! to `Direct`, and the edge emits one DONE control frame over the relayed
//! path. A direct-channel failure destroys the channel and falls back to
//! `Relayed` until the next `Connect`.

use hopline_core::{
    DirectChannel, DirectError, DirectEvent, DirectHandle, Duplex, MigrationTag, RelayError,
};
use hopline_relay::RelayConnection;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const LENGTH_PREFIX_LEN: usize = 4;

/// Path currently used for outbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Sending through the relay
    Relayed,
    /// Sending through the direct channel
    Direct,
}

/// Prefix `data` with its length as a big-endian `u32`
///
/// # Errors
///
/// Returns [`DirectError::Send`] if `data` does not fit a `u32` length.
pub fn encode_with_length_prefix(data: &[u8]) -> Result<Vec<u8>, DirectError> {
    let len = u32::try_from(data.len())
        .map_err(|_| DirectError::Send(format!("message of {} bytes too large", data.len())))?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + data.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Reassembles length-prefixed messages from arbitrarily chunked input
#[derive(Debug, Default)]
pub struct LengthPrefixedDecoder {
    buf: Vec<u8>,
}

impl LengthPrefixedDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(header) = self.buf.first_chunk::<LENGTH_PREFIX_LEN>() {
            let end = usize::try_from(u32::from_be_bytes(*header))
                .ok()
                .and_then(|len| len.checked_add(LENGTH_PREFIX_LEN));
            let Some(end) = end else {
                tracing::warn!(buffered = self.buf.len(), "length prefix overflows, dropping buffer");
                self.buf.clear();
                break;
            };
            if self.buf.len() < end {
                break;
            }
            messages.push(self.buf[LENGTH_PREFIX_LEN..end].to_vec());
            self.buf.drain(..end);
        }
        messages
    }

    /// Bytes held back waiting for the rest of a message
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Handle of a running migration wrapper
#[derive(Debug, Clone)]
pub struct MigrationConnection {
    id: String,
    state: watch::Receiver<MigrationState>,
    done: watch::Receiver<bool>,
}

impl MigrationConnection {
    /// Wrap `relayed`, optionally with a direct channel
    ///
    /// Returns the handle and the application-facing stream. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new(relayed: Duplex, direct: Option<DirectHandle>) -> (Self, Duplex) {
        let capacity = relayed.sink.max_capacity();
        let (app_side, driver_side) = Duplex::pair(capacity);
        let (state_tx, state) = watch::channel(MigrationState::Relayed);
        let (done_tx, done) = watch::channel(false);
        let id = hex::encode(rand::random::<[u8; 4]>());

        let (relayed_source, relayed_sink) = relayed.split();
        let (upper_in, upper_out) = driver_side.split();
        let (channel, events) = match direct {
            Some(handle) => (Some(handle.channel), Some(handle.events)),
            None => (None, None),
        };

        let driver = Driver {
            id: id.clone(),
            relayed_source,
            relayed_sink: Some(relayed_sink),
            upper_in,
            upper_out,
            channel,
            events,
            decoder: LengthPrefixedDecoder::new(),
            state: state_tx,
            failed: false,
        };

        tokio::spawn(async move {
            driver.run().await;
            done_tx.send_replace(true);
        });

        (Self { id, state, done }, app_side)
    }

    /// Wrap the current epoch of a relayed connection and its direct channel
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SourceTaken`] if the connection's source was
    /// already taken.
    pub fn from_relay(conn: &RelayConnection) -> Result<(Self, Duplex), RelayError> {
        let relayed = conn.into_duplex()?;
        Ok(Self::new(relayed, conn.take_direct()))
    }

    /// Instance identifier used in logs
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current outbound path
    #[must_use]
    pub fn state(&self) -> MigrationState {
        *self.state.borrow()
    }

    /// Watch outbound path changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MigrationState> {
        self.state.clone()
    }

    /// Resolve once the wrapper has shut down
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}

struct Driver {
    id: String,
    relayed_source: mpsc::Receiver<Vec<u8>>,
    relayed_sink: Option<mpsc::Sender<Vec<u8>>>,
    upper_in: mpsc::Receiver<Vec<u8>>,
    upper_out: mpsc::Sender<Vec<u8>>,
    channel: Option<Arc<dyn DirectChannel>>,
    events: Option<mpsc::UnboundedReceiver<DirectEvent>>,
    decoder: LengthPrefixedDecoder,
    state: watch::Sender<MigrationState>,
    failed: bool,
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<DirectEvent>>) -> Option<DirectEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        let mut relayed_open = true;
        let mut writes_open = true;

        loop {
            if !writes_open && self.upper_out.is_closed() {
                break;
            }

            // 1. direct channel events
            // 2. inbound relayed frames
            // 3. application writes
            tokio::select! {
                biased;
                event = next_event(&mut self.events), if self.events.is_some() => match event {
                    Some(event) => self.on_event(event).await,
                    None => self.events = None,
                },
                inbound = self.relayed_source.recv(), if relayed_open => match inbound {
                    Some(frame) => self.on_relayed(frame).await,
                    None => {
                        tracing::debug!(id = %self.id, "relayed stream ended");
                        relayed_open = false;
                    }
                },
                outbound = self.upper_in.recv(), if writes_open => match outbound {
                    Some(data) => self.on_write(data).await,
                    None => {
                        writes_open = false;
                        self.relayed_sink = None;
                    }
                },
                else => break,
            }
        }

        if let Some(channel) = self.channel.take() {
            channel.destroy();
        }
        tracing::debug!(id = %self.id, "migration wrapper closed");
    }

    fn current(&self) -> MigrationState {
        *self.state.borrow()
    }

    async fn on_event(&mut self, event: DirectEvent) {
        match event {
            DirectEvent::Connect => {
                tracing::debug!(id = %self.id, "direct channel connected");
                self.failed = false;
                self.go_direct().await;
            }
            DirectEvent::Data(chunk) => {
                for message in self.decoder.push(&chunk) {
                    self.deliver_tagged(&message).await;
                }
            }
            DirectEvent::Signal(_) => {
                tracing::trace!(id = %self.id, "signal event without relay, dropping");
            }
            DirectEvent::Error(e) => {
                tracing::warn!(id = %self.id, "direct channel error: {}", e);
                self.fall_back();
            }
            DirectEvent::Close => {
                tracing::debug!(id = %self.id, "direct channel closed");
                self.fall_back();
            }
        }
    }

    async fn on_relayed(&mut self, frame: Vec<u8>) {
        let Some((&tag, payload)) = frame.split_first() else {
            tracing::trace!(id = %self.id, "ignoring empty message");
            return;
        };

        match MigrationTag::try_from(tag) {
            Ok(MigrationTag::NotDone) => self.deliver(payload).await,
            Ok(MigrationTag::Done) => {
                tracing::debug!(id = %self.id, "DONE received");
                if !self.failed && self.channel.is_some() {
                    self.go_direct().await;
                }
                self.deliver(payload).await;
            }
            Err(e) => tracing::warn!(id = %self.id, "{}. Dropping message.", e),
        }
    }

    async fn on_write(&mut self, data: Vec<u8>) {
        let mut tagged = Vec::with_capacity(data.len() + 1);
        tagged.push(MigrationTag::NotDone as u8);
        tagged.extend_from_slice(&data);

        if self.current() == MigrationState::Direct {
            match self.send_direct(&tagged) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(id = %self.id, "direct send failed, falling back to relay: {}", e);
                    self.fall_back();
                }
            }
        }

        self.send_relayed(tagged).await;
    }

    fn send_direct(&self, tagged: &[u8]) -> Result<(), DirectError> {
        let channel = self.channel.as_ref().ok_or(DirectError::Closed)?;
        channel.send(encode_with_length_prefix(tagged)?)
    }

    async fn send_relayed(&mut self, frame: Vec<u8>) {
        let Some(sink) = &self.relayed_sink else {
            return;
        };
        if sink.send(frame).await.is_err() {
            tracing::debug!(id = %self.id, "relayed sink gone");
            self.relayed_sink = None;
        }
    }

    async fn go_direct(&mut self) {
        if self.current() == MigrationState::Direct || self.channel.is_none() {
            return;
        }

        self.state.send_replace(MigrationState::Direct);
        tracing::debug!(id = %self.id, "switched to direct channel, sending DONE");
        self.send_relayed(vec![MigrationTag::Done as u8]).await;
    }

    fn fall_back(&mut self) {
        self.failed = true;
        if let Some(channel) = &self.channel {
            channel.destroy();
        }
        if self.state.send_replace(MigrationState::Relayed) == MigrationState::Direct {
            tracing::debug!(id = %self.id, "reverted to relayed path");
        }
    }

    async fn deliver_tagged(&mut self, message: &[u8]) {
        let Some((&tag, payload)) = message.split_first() else {
            return;
        };
        match MigrationTag::try_from(tag) {
            Ok(_) => self.deliver(payload).await,
            Err(e) => tracing::warn!(id = %self.id, "{}. Dropping direct message.", e),
        }
    }

    async fn deliver(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        if self.upper_out.send(payload.to_vec()).await.is_err() {
            tracing::trace!(id = %self.id, "application source dropped, discarding");
        }
    }
}
