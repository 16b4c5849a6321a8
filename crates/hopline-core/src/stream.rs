//! Message-oriented duplex byte streams.
//!
//! A [`Duplex`] is the shape every layer in hopline exchanges: a pull-side
//! `source` of byte messages and a push-side `sink`. Message boundaries are
//! preserved end to end.

use tokio::sync::mpsc;

/// Default buffer size for in-memory stream halves
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A bidirectional message stream
#[derive(Debug)]
pub struct Duplex {
    /// Incoming messages
    pub source: mpsc::Receiver<Vec<u8>>,
    /// Outgoing messages
    pub sink: mpsc::Sender<Vec<u8>>,
}

impl Duplex {
    /// Build a duplex from its halves
    #[must_use]
    pub fn new(source: mpsc::Receiver<Vec<u8>>, sink: mpsc::Sender<Vec<u8>>) -> Self {
        Self { source, sink }
    }

    /// Two duplexes wired to each other: what one sends, the other receives
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);

        (Self::new(b_rx, a_tx), Self::new(a_rx, b_tx))
    }

    /// Split into `(source, sink)`
    #[must_use]
    pub fn split(self) -> (mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>) {
        (self.source, self.sink)
    }
}
