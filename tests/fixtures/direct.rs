//! In-memory direct channel
//!
//! Two [`LoopbackChannel`]s are wired to each other: bytes sent on one arrive
//! as [`DirectEvent::Data`] on the other. Lifecycle events (`Connect`,
//! `Error`, ...) are injected by the test through [`LoopbackEnd::events`].

use hopline_core::{DirectChannel, DirectError, DirectEvent, DirectHandle, DirectUpgrader};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One side of an in-memory direct channel
#[derive(Debug)]
pub struct LoopbackChannel {
    peer: mpsc::UnboundedSender<DirectEvent>,
    signals: Mutex<Vec<serde_json::Value>>,
    sent: AtomicUsize,
    destroyed: AtomicBool,
}

impl LoopbackChannel {
    /// Signals received from the counterparty, in order
    pub fn signals(&self) -> Vec<serde_json::Value> {
        self.signals.lock().unwrap().clone()
    }

    /// Number of successful sends
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Returns `true` once `destroy` was called
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl DirectChannel for LoopbackChannel {
    fn send(&self, data: Vec<u8>) -> Result<(), DirectError> {
        if self.is_destroyed() {
            return Err(DirectError::Closed);
        }
        self.peer
            .send(DirectEvent::Data(data))
            .map_err(|_| DirectError::Closed)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn signal(&self, signal: serde_json::Value) -> Result<(), DirectError> {
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Test-side controls of one loopback channel
pub struct LoopbackEnd {
    /// The channel
    pub channel: Arc<LoopbackChannel>,
    /// Inject events as if the channel emitted them
    pub events: mpsc::UnboundedSender<DirectEvent>,
    handle: Option<DirectHandle>,
}

impl LoopbackEnd {
    /// Hand out the handle to give to the code under test
    pub fn take_handle(&mut self) -> DirectHandle {
        self.handle.take().expect("handle already taken")
    }
}

/// Two channels wired to each other
pub fn loopback_pair() -> (LoopbackEnd, LoopbackEnd) {
    let (a_events, a_rx) = mpsc::unbounded_channel();
    let (b_events, b_rx) = mpsc::unbounded_channel();

    let end = |peer: mpsc::UnboundedSender<DirectEvent>,
               events: mpsc::UnboundedSender<DirectEvent>,
               rx: mpsc::UnboundedReceiver<DirectEvent>| {
        let channel = Arc::new(LoopbackChannel {
            peer,
            signals: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        });
        LoopbackEnd {
            handle: Some(DirectHandle::new(channel.clone(), rx)),
            channel,
            events,
        }
    };

    let a = end(b_events.clone(), a_events.clone(), a_rx);
    let b = end(a_events, b_events, b_rx);
    (a, b)
}

/// Upgrader handing out channels that never connect
///
/// Keeps every attempt so tests can inspect them.
#[derive(Debug, Default)]
pub struct LoopbackUpgrader {
    attempts: Mutex<Vec<Arc<LoopbackChannel>>>,
}

impl LoopbackUpgrader {
    /// Number of inbound attempts started
    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

impl DirectUpgrader for LoopbackUpgrader {
    fn upgrade_inbound(&self) -> DirectHandle {
        let (mut end, _) = loopback_pair();
        self.attempts.lock().unwrap().push(end.channel.clone());
        end.take_handle()
    }
}
