//! Priority queue of pending control and signalling frames.
//!
//! Frames are ordered by [`frame::compare`](crate::frame::compare), FIFO among
//! frames with the same prefix. A STOP short-circuits everything: once it is
//! queued every other entry is discarded, and later pushes are ignored until
//! the STOP has been popped.

use crate::error::QueueError;
use crate::frame::{self, Frame};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug)]
struct Entry {
    seq: u64,
    frame: Vec<u8>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: the frame that must go out first is "greatest".
    fn cmp(&self, other: &Self) -> Ordering {
        frame::compare(&other.frame, &self.frame).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Heap {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    stop_pending: bool,
}

/// Status queue with a level-triggered readiness signal
#[derive(Debug)]
pub struct StatusQueue {
    heap: Mutex<Heap>,
    ready: watch::Sender<bool>,
}

impl StatusQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            heap: Mutex::new(Heap::default()),
            ready,
        }
    }

    /// Queue a framed message and mark the queue ready
    pub fn push(&self, msg: Vec<u8>) {
        {
            let mut heap = self.lock();

            if heap.stop_pending {
                tracing::trace!("STOP pending, dropping queued message");
                return;
            }

            if Frame::is_stop(&msg) {
                heap.entries.clear();
                heap.stop_pending = true;
            }

            let seq = heap.next_seq;
            heap.next_seq += 1;
            heap.entries.push(Entry { seq, frame: msg });
        }

        self.ready.send_replace(true);
    }

    /// Take the next message
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Empty`] if nothing is queued.
    pub fn pop(&self) -> Result<Vec<u8>, QueueError> {
        let mut heap = self.lock();

        let msg = if heap.stop_pending {
            heap.entries.clear();
            heap.stop_pending = false;
            Frame::stop()
        } else {
            heap.entries.pop().ok_or(QueueError::Empty)?.frame
        };

        if heap.entries.is_empty() {
            self.ready.send_replace(false);
        }

        Ok(msg)
    }

    /// Number of queued messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least one message is queued
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Heap> {
        self.heap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for StatusQueue {
    fn default() -> Self {
        Self::new()
    }
}
