//! Client-side relayed connection.
//!
//! A [`RelayConnection`] multiplexes payload, liveness probes, control and
//! direct-channel signalling over one physical stream to the relay, and
//! survives the relay announcing a replaced stream (RESTART) without the upper
//! layer noticing anything beyond a reconnect callback.
//!
//! Two kinds of task run per connection:
//!
//! - one source loop per epoch, reading frames from the relay stream;
//! - one sink loop, writing status frames and upstream payload to the relay.
//!
//! The epoch counter is bumped by [`RelayConnection::switch`]. A source loop
//! bound to an old epoch stops reading as soon as it observes the change and
//! only releases the stream once the sink loop has migrated, so the new loop
//! starts from the first frame the old one did not consume.

use crate::signal::{lock, recv_optional, wait_at_least, wait_changed, wait_true};
use hopline_core::{
    ConnectionStatus, DirectChannel, DirectEvent, DirectHandle, DirectUpgrader, Duplex, Frame,
    PeerAddr, PeerId, Prefix, RelayConfig, RelayError, StatusMessage, StatusQueue, decode_signal,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};

/// Future returned by a [`ReconnectHandler`]
pub type ReconnectFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked with the switched connection and the counterparty on RESTART
pub type ReconnectHandler = Arc<dyn Fn(RelayConnection, PeerId) -> ReconnectFuture + Send + Sync>;

/// Open/close timestamps of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    /// When the connection was created
    pub open: SystemTime,
    /// When the connection was closed, if it was
    pub close: Option<SystemTime>,
}

/// Direct-channel integration of a relayed connection
pub struct DirectUpgrade {
    /// Creates fresh inbound attempts after a switch
    pub upgrader: Arc<dyn DirectUpgrader>,
    /// The attempt in progress when the connection is created
    pub initial: DirectHandle,
}

/// Construction parameters of a [`RelayConnection`]
pub struct RelayConnectionOptions {
    /// Stream to the relay
    pub stream: Duplex,
    /// Local peer
    pub local: PeerId,
    /// Relaying peer
    pub relay: PeerId,
    /// Peer on the other side of the relay
    pub counterparty: PeerId,
    /// Reconnection callback
    pub on_reconnect: ReconnectHandler,
    /// Optional direct-channel upgrade
    pub direct: Option<DirectUpgrade>,
    /// Relay settings
    pub config: RelayConfig,
}

struct DirectState {
    upgrader: Arc<dyn DirectUpgrader>,
    channel: Arc<dyn DirectChannel>,
    events: Option<mpsc::UnboundedReceiver<DirectEvent>>,
}

struct Inner {
    id: String,
    local_addr: PeerAddr,
    remote_addr: PeerAddr,
    counterparty: PeerId,
    config: RelayConfig,
    queue: StatusQueue,
    stream_source: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    iteration: watch::Sender<u64>,
    switching: Mutex<()>,
    migrated: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    destroyed: watch::Sender<bool>,
    timeline: Mutex<Timeline>,
    upper_source: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    attach: mpsc::UnboundedSender<(u64, mpsc::Receiver<Vec<u8>>)>,
    on_reconnect: ReconnectHandler,
    direct: Mutex<Option<DirectState>>,
    fault: Mutex<Option<RelayError>>,
}

/// Relayed connection handle. Clones share the same connection.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

enum Flow {
    Continue,
    Break,
}

impl RelayConnection {
    /// Create the connection and start its loops
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(opts: RelayConnectionOptions) -> Self {
        let (stream_source, stream_sink) = opts.stream.split();
        let (attach, attach_rx) = mpsc::unbounded_channel();
        let (upper_tx, upper_rx) = mpsc::channel(opts.config.channel_capacity);
        let (iteration, _) = watch::channel(0);
        let (migrated, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        let (destroyed, _) = watch::channel(false);

        let (direct, initial) = match opts.direct {
            Some(upgrade) => (
                Some(DirectState {
                    upgrader: upgrade.upgrader,
                    channel: upgrade.initial.channel.clone(),
                    events: None,
                }),
                Some(upgrade.initial),
            ),
            None => (None, None),
        };

        let conn = Self {
            inner: Arc::new(Inner {
                id: hex::encode(rand::random::<[u8; 4]>()),
                local_addr: PeerAddr::circuit(opts.relay, opts.local),
                remote_addr: PeerAddr::circuit(opts.relay, opts.counterparty),
                counterparty: opts.counterparty,
                config: opts.config,
                queue: StatusQueue::new(),
                stream_source: tokio::sync::Mutex::new(stream_source),
                iteration,
                switching: Mutex::new(()),
                migrated,
                closed,
                destroyed,
                timeline: Mutex::new(Timeline {
                    open: SystemTime::now(),
                    close: None,
                }),
                upper_source: Mutex::new(Some(upper_rx)),
                attach,
                on_reconnect: opts.on_reconnect,
                direct: Mutex::new(direct),
                fault: Mutex::new(None),
            }),
        };

        if let Some(handle) = initial {
            conn.arm_direct(0, handle);
        }

        conn.spawn_sink(stream_sink, attach_rx);
        tokio::spawn(conn.clone().source_loop(0, upper_tx));

        tracing::debug!(id = %conn.inner.id, remote = %conn.inner.remote_addr, "relay connection opened");

        conn
    }

    /// Instance identifier used in logs
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// `/p2p/<relay>/p2p-circuit/p2p/<local>`
    #[must_use]
    pub fn local_addr(&self) -> &PeerAddr {
        &self.inner.local_addr
    }

    /// `/p2p/<relay>/p2p-circuit/p2p/<counterparty>`
    #[must_use]
    pub fn remote_addr(&self) -> &PeerAddr {
        &self.inner.remote_addr
    }

    /// Peer on the other side of the relay
    #[must_use]
    pub fn counterparty(&self) -> PeerId {
        self.inner.counterparty
    }

    /// Current epoch
    #[must_use]
    pub fn iteration(&self) -> u64 {
        *self.inner.iteration.borrow()
    }

    /// Returns `true` once STOP was sent or received
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        *self.inner.destroyed.borrow()
    }

    /// Open/close timestamps
    #[must_use]
    pub fn timeline(&self) -> Timeline {
        *lock(&self.inner.timeline)
    }

    /// Take the payload source of the current epoch
    ///
    /// Returns `None` if it was already taken. A new source is armed by every
    /// [`switch`](Self::switch).
    pub fn source(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        lock(&self.inner.upper_source).take()
    }

    /// Attach an upstream producer whose messages are sent as payload
    ///
    /// The attachment is bound to the current epoch; it is discarded if the
    /// connection switches before the sink loop picks it up.
    pub fn sink(&self, source: mpsc::Receiver<Vec<u8>>) {
        let epoch = self.iteration();
        if self.inner.attach.send((epoch, source)).is_err() {
            tracing::debug!(id = %self.inner.id, "sink attached after connection ended");
        }
    }

    /// Source and sink of the current epoch as a [`Duplex`]
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SourceTaken`] if the source was already taken.
    pub fn into_duplex(&self) -> Result<Duplex, RelayError> {
        let source = self.source().ok_or(RelayError::SourceTaken)?;
        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);
        self.sink(rx);
        Ok(Duplex::new(source, tx))
    }

    /// Take the live direct channel with its non-signalling events
    ///
    /// Signalling events are consumed by the connection itself and forwarded
    /// to the counterparty through the relay.
    pub fn take_direct(&self) -> Option<DirectHandle> {
        let mut direct = lock(&self.inner.direct);
        let state = direct.as_mut()?;
        let events = state.events.take()?;
        Some(DirectHandle::new(state.channel.clone(), events))
    }

    /// Send STOP and resolve once the connection is destroyed
    ///
    /// Calling `close` on a destroyed connection resolves immediately.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the connection's loops, if any.
    pub async fn close(&self) -> Result<(), RelayError> {
        if self.is_destroyed() {
            return Ok(());
        }

        tracing::trace!(id = %self.inner.id, "close called");

        self.inner.queue.push(Frame::stop());
        self.set_closed();

        let mut destroyed = self.inner.destroyed.subscribe();
        wait_true(&mut destroyed).await;

        match lock(&self.inner.fault).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start a new epoch on the same relay stream
    ///
    /// Destroys the live direct-channel attempt, bumps the epoch, arms a fresh
    /// source loop and, if direct upgrades are enabled, starts a fresh inbound
    /// attempt.
    ///
    /// Concurrent switches are serialized: each one gets its own epoch and
    /// the payload source of the last one stays armed.
    pub fn switch(&self) -> RelayConnection {
        let inner = &self.inner;
        let switching = lock(&inner.switching);

        if let Some(state) = lock(&inner.direct).as_ref() {
            state.channel.destroy();
        }

        let mut epoch = 0;
        inner.iteration.send_modify(|current| {
            *current += 1;
            epoch = *current;
        });

        let (upper_tx, upper_rx) = mpsc::channel(inner.config.channel_capacity);
        *lock(&inner.upper_source) = Some(upper_rx);

        let fresh = lock(&inner.direct)
            .as_ref()
            .map(|state| state.upgrader.upgrade_inbound());
        if let Some(handle) = fresh {
            self.arm_direct(epoch, handle);
        }

        tokio::spawn(self.clone().source_loop(epoch, upper_tx));

        drop(switching);
        tracing::debug!(id = %inner.id, epoch, "switched");

        self.clone()
    }

    fn set_closed(&self) {
        let first = !self.inner.closed.send_replace(true);
        if first {
            lock(&self.inner.timeline).close = Some(SystemTime::now());
        }
    }

    fn mark_destroyed(&self) {
        self.inner.destroyed.send_replace(true);
        self.set_closed();
    }

    /// Route events of `handle`: signals go out through the relay, the rest
    /// is kept for whoever takes the direct channel.
    fn arm_direct(&self, epoch: u64, handle: DirectHandle) {
        let (forward, forwarded) = mpsc::unbounded_channel();

        if let Some(state) = lock(&self.inner.direct).as_mut() {
            state.channel = handle.channel;
            state.events = Some(forwarded);
        }

        tokio::spawn(self.clone().direct_events(epoch, handle.events, forward));
    }

    async fn direct_events(
        self,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<DirectEvent>,
        forward: mpsc::UnboundedSender<DirectEvent>,
    ) {
        let mut iteration = self.inner.iteration.subscribe();
        let mut closed = self.inner.closed.subscribe();

        loop {
            let event = tokio::select! {
                biased;
                _ = wait_changed(&mut iteration, epoch) => break,
                _ = wait_true(&mut closed) => break,
                event = events.recv() => event,
            };

            match event {
                Some(DirectEvent::Signal(signal)) => {
                    tracing::trace!(id = %self.inner.id, epoch, "queueing signalling message");
                    self.inner.queue.push(Frame::signalling(&signal));
                }
                Some(other) => {
                    let _ = forward.send(other);
                }
                None => break,
            }
        }
    }

    async fn source_loop(self, epoch: u64, upper: mpsc::Sender<Vec<u8>>) {
        let inner = &self.inner;
        let mut iteration = inner.iteration.subscribe();
        let mut closed = inner.closed.subscribe();

        let mut stream = inner.stream_source.lock().await;

        if *iteration.borrow() != epoch {
            tracing::trace!(id = %inner.id, epoch, "superseded before start");
            return;
        }

        tracing::trace!(id = %inner.id, epoch, "source loop started");

        loop {
            let received = tokio::select! {
                biased;
                _ = wait_true(&mut closed) => break,
                _ = wait_changed(&mut iteration, epoch) => {
                    // Keep the stream until the sink has migrated, so the
                    // next epoch starts exactly where this one stopped.
                    let next = *iteration.borrow();
                    let mut migrated = inner.migrated.subscribe();
                    let mut destroyed = inner.destroyed.subscribe();
                    tokio::select! {
                        _ = wait_at_least(&mut migrated, next) => {}
                        _ = wait_true(&mut destroyed) => {}
                    }
                    tracing::trace!(id = %inner.id, epoch, "migration done, ending source loop");
                    break;
                }
                received = stream.recv() => received,
            };

            let Some(received) = received else {
                tracing::debug!(id = %inner.id, epoch, "relay stream ended");
                break;
            };

            match self.handle_frame(epoch, received, &upper, &mut closed).await {
                Flow::Continue => {}
                Flow::Break => break,
            }
        }
    }

    async fn handle_frame(
        &self,
        epoch: u64,
        frame: Vec<u8>,
        upper: &mpsc::Sender<Vec<u8>>,
        closed: &mut watch::Receiver<bool>,
    ) -> Flow {
        let inner = &self.inner;

        let (prefix, body) = match Frame::parse(&frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(id = %inner.id, "{}. Dropping message.", e);
                return Flow::Continue;
            }
        };

        if body.is_empty() {
            tracing::trace!(id = %inner.id, "ignoring empty message");
            return Flow::Continue;
        }

        match prefix {
            Prefix::ConnectionStatus => match ConnectionStatus::try_from(body[0]) {
                Ok(ConnectionStatus::Stop) => {
                    tracing::debug!(id = %inner.id, epoch, "STOP received");
                    self.mark_destroyed();
                    Flow::Break
                }
                Ok(ConnectionStatus::Restart) => {
                    tracing::debug!(id = %inner.id, epoch, "RESTART received, switching");
                    let switched = self.switch();
                    let on_reconnect = inner.on_reconnect.clone();
                    let counterparty = inner.counterparty;
                    tokio::spawn(async move { on_reconnect(switched, counterparty).await });
                    Flow::Continue
                }
                Err(e) => {
                    tracing::error!(id = %inner.id, "{}. Dropping message.", e);
                    Flow::Continue
                }
            },
            Prefix::StatusMessage => {
                match StatusMessage::try_from(body[0]) {
                    Ok(StatusMessage::Ping) => {
                        tracing::trace!(id = %inner.id, "PING received");
                        inner.queue.push(Frame::pong());
                    }
                    Ok(StatusMessage::Pong) => {}
                    Err(e) => tracing::error!(id = %inner.id, "{}. Dropping message.", e),
                }
                Flow::Continue
            }
            Prefix::WebRtcSignalling => {
                match decode_signal(body) {
                    Ok(signal) => {
                        let channel = lock(&inner.direct).as_ref().map(|s| s.channel.clone());
                        if let Some(channel) = channel {
                            if let Err(e) = channel.signal(signal) {
                                tracing::error!(id = %inner.id, "direct channel error: {}", e);
                            }
                        }
                    }
                    Err(e) => tracing::error!(id = %inner.id, "{}", e),
                }
                Flow::Continue
            }
            Prefix::Payload => {
                tokio::select! {
                    biased;
                    _ = wait_true(closed) => Flow::Break,
                    sent = upper.send(body.to_vec()) => {
                        if sent.is_err() {
                            tracing::trace!(id = %inner.id, epoch, "payload source dropped, discarding");
                        }
                        Flow::Continue
                    }
                }
            }
        }
    }

    fn spawn_sink(
        &self,
        sink: mpsc::Sender<Vec<u8>>,
        attach: mpsc::UnboundedReceiver<(u64, mpsc::Receiver<Vec<u8>>)>,
    ) {
        let conn = self.clone();
        tokio::spawn(async move {
            match conn.sink_loop(&sink, attach).await {
                Ok(()) => {}
                Err(RelayError::StreamClosed) => {
                    tracing::debug!(id = %conn.inner.id, "relay stream closed");
                }
                Err(e) => {
                    tracing::error!(id = %conn.inner.id, "sink loop failed: {}", e);
                    *lock(&conn.inner.fault) = Some(e);
                }
            }
            conn.mark_destroyed();
        });
    }

    async fn sink_loop(
        &self,
        sink: &mpsc::Sender<Vec<u8>>,
        mut attach: mpsc::UnboundedReceiver<(u64, mpsc::Receiver<Vec<u8>>)>,
    ) -> Result<(), RelayError> {
        let inner = &self.inner;
        let mut iteration = inner.iteration.subscribe();
        let mut destroyed = inner.destroyed.subscribe();
        let mut current_epoch = *iteration.borrow();
        let mut upstream: Option<mpsc::Receiver<Vec<u8>>> = None;

        loop {
            // 0. destroyed by a received STOP
            // 1. stream switch
            // 2. upstream attach
            // 3. status messages
            // 4. payload
            let msg = tokio::select! {
                biased;
                _ = wait_true(&mut destroyed) => return Ok(()),
                _ = wait_changed(&mut iteration, current_epoch) => {
                    current_epoch = *iteration.borrow();
                    upstream = None;
                    inner.migrated.send_replace(current_epoch);
                    tracing::trace!(id = %inner.id, epoch = current_epoch, "sink switched");
                    continue;
                }
                attached = attach.recv(), if upstream.is_none() => {
                    match attached {
                        Some((epoch, source)) if epoch == current_epoch => upstream = Some(source),
                        Some((epoch, _)) => {
                            tracing::trace!(id = %inner.id, epoch, "discarding stale sink source");
                        }
                        None => return Err(RelayError::UnexpectedDone("sink attach")),
                    }
                    continue;
                }
                _ = inner.queue.ready() => inner.queue.pop()?,
                received = recv_optional(&mut upstream) => match received {
                    Some(data) => Frame::payload(&data),
                    None => {
                        upstream = None;
                        continue;
                    }
                },
            };

            let stop = Frame::is_stop(&msg);

            sink.send(msg).await.map_err(|_| RelayError::StreamClosed)?;

            if stop {
                tracing::debug!(id = %inner.id, "STOP sent");
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("iteration", &self.iteration())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
