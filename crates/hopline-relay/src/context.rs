//! Relay-side forwarding context.
//!
//! The relaying peer keeps one [`RelayContext`] per relayed stream. The
//! context's `source` yields the frames its client sent, minus the liveness
//! probes it answers itself; its `sink` drains the other party's frames into
//! the client stream. Pairing two contexts crosswise bridges two clients:
//!
//! ```text
//!   client A ──stream──▶ ctx A.source ──▶ ctx B.sink ──stream──▶ client B
//!   client A ◀─stream─── ctx A.sink ◀── ctx B.source ◀─stream─── client B
//! ```
//!
//! When a client reconnects, [`RelayContext::update`] swaps in the new stream.
//! The source side then forwards a synthesized RESTART so the far side starts
//! its reconnection path, and the sink side restarts its drain loop against
//! the new stream.

use crate::signal::{lock, recv_optional};
use hopline_core::{
    ConnectionStatus, Duplex, Frame, Prefix, RelayConfig, RelayError, StatusMessage, StatusQueue,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Notifications for listeners of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// The client stream was replaced and RESTART forwarded
    Restarted,
    /// STOP was forwarded, the context is done
    Closed,
}

struct Shared {
    id: String,
    queue: StatusQueue,
    /// Outstanding pings in send order, each answered by one PONG
    pongs: Mutex<VecDeque<(u64, oneshot::Sender<()>)>>,
    next_ping: AtomicU64,
    events: broadcast::Sender<ContextEvent>,
}

/// Relay-side state of one relayed stream
pub struct RelayContext {
    shared: Arc<Shared>,
    ping_timeout: Duration,
    source_switch: mpsc::UnboundedSender<mpsc::Receiver<Vec<u8>>>,
    sink_switch: mpsc::UnboundedSender<mpsc::Sender<Vec<u8>>>,
    attach: mpsc::UnboundedSender<mpsc::Receiver<Vec<u8>>>,
    forwarded: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl RelayContext {
    /// Start forwarding for `stream`
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(stream: Duplex, config: &RelayConfig) -> Self {
        let (source, sink) = stream.split();
        let (source_switch, source_switch_rx) = mpsc::unbounded_channel();
        let (sink_switch, sink_switch_rx) = mpsc::unbounded_channel();
        let (attach, attach_rx) = mpsc::unbounded_channel();
        let (forward_tx, forward_rx) = mpsc::channel(config.channel_capacity);
        let (events, _) = broadcast::channel(16);

        let shared = Arc::new(Shared {
            id: hex::encode(rand::random::<[u8; 4]>()),
            queue: StatusQueue::new(),
            pongs: Mutex::new(VecDeque::new()),
            next_ping: AtomicU64::new(0),
            events,
        });

        tokio::spawn(source_loop(
            shared.clone(),
            source,
            source_switch_rx,
            forward_tx,
        ));

        let drain = SinkDrain {
            shared: shared.clone(),
            switches: sink_switch_rx,
            attach: attach_rx,
            upstream: None,
            pending: None,
        };
        tokio::spawn(drain.run(sink));

        tracing::debug!(id = %shared.id, "relay context created");

        Self {
            shared,
            ping_timeout: config.ping_timeout(),
            source_switch,
            sink_switch,
            attach,
            forwarded: Mutex::new(Some(forward_rx)),
        }
    }

    /// Wire two contexts crosswise so each one's client hears the other
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SourceTaken`] if either source was already taken.
    pub fn pair(a: &RelayContext, b: &RelayContext) -> Result<(), RelayError> {
        let a_source = a.source().ok_or(RelayError::SourceTaken)?;
        let Some(b_source) = b.source() else {
            *lock(&a.forwarded) = Some(a_source);
            return Err(RelayError::SourceTaken);
        };
        a.sink(b_source);
        b.sink(a_source);
        Ok(())
    }

    /// Instance identifier used in logs
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Take the stream of frames to forward to the other party
    pub fn source(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        lock(&self.forwarded).take()
    }

    /// Attach the frames to deliver to this context's client
    pub fn sink(&self, source: mpsc::Receiver<Vec<u8>>) {
        if self.attach.send(source).is_err() {
            tracing::debug!(id = %self.shared.id, "sink attached after context ended");
        }
    }

    /// Subscribe to context notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.shared.events.subscribe()
    }

    /// Send a low-level PING to the client
    ///
    /// Returns the measured latency in milliseconds, or `-1` if no PONG
    /// arrived within `timeout` (default from [`RelayConfig::ping_timeout`]).
    /// Overlapping pings are answered in the order they were sent.
    pub async fn ping(&self, timeout: Option<Duration>) -> i64 {
        let timeout = timeout.unwrap_or(self.ping_timeout);
        let (tx, rx) = oneshot::channel();
        let seq = self.shared.next_ping.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.pongs).push_back((seq, tx));

        let start = Instant::now();
        self.shared.queue.push(Frame::ping());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX),
            _ => {
                tracing::debug!(id = %self.shared.id, "ping timeout");
                lock(&self.shared.pongs).retain(|(pending, _)| *pending != seq);
                -1
            }
        }
    }

    /// Replace the client stream
    pub fn update(&self, stream: Duplex) {
        let (source, sink) = stream.split();
        let _ = self.source_switch.send(source);
        let _ = self.sink_switch.send(sink);
        tracing::debug!(id = %self.shared.id, "updating");
    }
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

/// Forward frames from the current client stream
async fn source_loop(
    shared: Arc<Shared>,
    mut current: mpsc::Receiver<Vec<u8>>,
    mut switches: mpsc::UnboundedReceiver<mpsc::Receiver<Vec<u8>>>,
    out: mpsc::Sender<Vec<u8>>,
) {
    let id = shared.id.clone();
    let mut switches_open = true;
    let mut exhausted = false;

    loop {
        // 1. stream switches
        // 2. payload / status messages
        let received = tokio::select! {
            biased;
            switched = switches.recv(), if switches_open => {
                match switched {
                    Some(source) => {
                        current = source;
                        exhausted = false;
                        tracing::trace!(id = %id, "source switched, forwarding RESTART");
                        let _ = shared.events.send(ContextEvent::Restarted);
                        if out.send(Frame::restart()).await.is_err() {
                            break;
                        }
                    }
                    None => switches_open = false,
                }
                continue;
            }
            received = current.recv(), if !exhausted => received,
            else => break,
        };

        let Some(frame) = received else {
            tracing::trace!(id = %id, "client stream ended, waiting for update");
            exhausted = true;
            continue;
        };

        let (prefix, body) = match Frame::parse(&frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(id = %id, "{}. Dropping message in relay context.", e);
                continue;
            }
        };

        match prefix {
            Prefix::StatusMessage => {
                match body.first().map(|code| StatusMessage::try_from(*code)) {
                    Some(Ok(StatusMessage::Ping)) => {
                        tracing::trace!(id = %id, "PING received");
                        shared.queue.push(Frame::pong());
                    }
                    Some(Ok(StatusMessage::Pong)) => {
                        tracing::trace!(id = %id, "PONG received");
                        if let Some((_, responder)) = lock(&shared.pongs).pop_front() {
                            let _ = responder.send(());
                        }
                    }
                    _ => tracing::error!(id = %id, "invalid status message, dropping"),
                }
                continue;
            }
            Prefix::ConnectionStatus
                if body.first().copied() == Some(ConnectionStatus::Stop as u8) =>
            {
                tracing::debug!(id = %id, "STOP relayed");
                let _ = shared.events.send(ContextEvent::Closed);
                let _ = out.send(frame).await;
                break;
            }
            Prefix::ConnectionStatus => {
                tracing::debug!(id = %id, "RESTART relayed");
            }
            _ => {}
        }

        if out.send(frame).await.is_err() {
            tracing::debug!(id = %id, "forward target gone");
            break;
        }
    }

    tracing::trace!(id = %id, "source loop ended");
}

enum DrainEnd {
    Switched(mpsc::Sender<Vec<u8>>),
    Stopped,
    Detached,
    Failed(RelayError),
}

/// Writes status frames and forwarded frames into the client stream
struct SinkDrain {
    shared: Arc<Shared>,
    switches: mpsc::UnboundedReceiver<mpsc::Sender<Vec<u8>>>,
    attach: mpsc::UnboundedReceiver<mpsc::Receiver<Vec<u8>>>,
    upstream: Option<mpsc::Receiver<Vec<u8>>>,
    pending: Option<Vec<u8>>,
}

impl SinkDrain {
    async fn run(mut self, mut sink: mpsc::Sender<Vec<u8>>) {
        let mut generation: u64 = 0;

        loop {
            match self.drain(&sink).await {
                DrainEnd::Switched(next) => {
                    sink = next;
                    generation += 1;
                    tracing::trace!(id = %self.shared.id, generation, "sink switched");
                }
                DrainEnd::Stopped => {
                    tracing::debug!(id = %self.shared.id, "STOP forwarded, sink done");
                    break;
                }
                DrainEnd::Detached => {
                    tracing::debug!(id = %self.shared.id, "sink detached");
                    break;
                }
                DrainEnd::Failed(e) => {
                    tracing::error!(id = %self.shared.id, "sink drain failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn drain(&mut self, sink: &mpsc::Sender<Vec<u8>>) -> DrainEnd {
        if let Some(msg) = self.pending.take() {
            if let Some(end) = self.deliver(sink, msg).await {
                return end;
            }
        }

        loop {
            // 0. source attach
            // 1. stream switches
            // 2. status messages
            // 3. forwarded frames
            let msg = tokio::select! {
                biased;
                switched = self.switches.recv() => {
                    return match switched {
                        Some(next) => DrainEnd::Switched(next),
                        None => DrainEnd::Detached,
                    };
                }
                attached = self.attach.recv(), if self.upstream.is_none() => {
                    match attached {
                        Some(source) => self.upstream = Some(source),
                        None => return DrainEnd::Detached,
                    }
                    continue;
                }
                _ = self.shared.queue.ready() => match self.shared.queue.pop() {
                    Ok(msg) => msg,
                    Err(e) => return DrainEnd::Failed(e.into()),
                },
                received = recv_optional(&mut self.upstream) => match received {
                    Some(frame) if frame.len() < 2 => {
                        tracing::trace!(id = %self.shared.id, "ignoring empty message");
                        continue;
                    }
                    Some(frame) => frame,
                    None => {
                        self.upstream = None;
                        continue;
                    }
                },
            };

            if let Some(end) = self.deliver(sink, msg).await {
                return end;
            }
        }
    }

    /// Write one frame; `Some` ends the current drain
    async fn deliver(&mut self, sink: &mpsc::Sender<Vec<u8>>, msg: Vec<u8>) -> Option<DrainEnd> {
        let stop = Frame::is_stop(&msg);

        if let Err(mpsc::error::SendError(msg)) = sink.send(msg).await {
            tracing::debug!(id = %self.shared.id, "client stream closed, waiting for update");
            self.pending = Some(msg);
            return Some(match self.switches.recv().await {
                Some(next) => DrainEnd::Switched(next),
                None => DrainEnd::Detached,
            });
        }

        stop.then_some(DrainEnd::Stopped)
    }
}
