//! Two clients talking through one relay
//!
//! Builds the full relayed path in memory:
//!
//! ```text
//! alice (RelayConnection) ── stream ── ctx A ═╗
//!                                             ║ RelayContext::pair
//! bob   (RelayConnection) ── stream ── ctx B ═╝
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hopline_integration_tests::fixtures::RelayedPair;
//!
//! #[tokio::test]
//! async fn test_basic_exchange() {
//!     let pair = RelayedPair::new();
//!     let mut alice = pair.alice.conn.into_duplex().unwrap();
//!     alice.sink.send(b"hi".to_vec()).await.unwrap();
//! }
//! ```

use hopline_core::{Duplex, PeerId, RelayConfig};
use hopline_relay::{
    DirectUpgrade, ReconnectFuture, ReconnectHandler, RelayConnection, RelayConnectionOptions, RelayContext,
};
use tokio::sync::mpsc;

/// Buffer size of the in-memory streams
const STREAM_CAPACITY: usize = 32;

/// One client of the pair
pub struct Client {
    /// The client's peer id
    pub id: PeerId,
    /// Connection through the relay
    pub conn: RelayConnection,
    /// Connections handed to the reconnect callback
    pub reconnects: mpsc::UnboundedReceiver<RelayConnection>,
}

/// Two clients bridged through two paired relay contexts
pub struct RelayedPair {
    /// Relaying peer
    pub relay: PeerId,
    /// Dialing client
    pub alice: Client,
    /// Answering client
    pub bob: Client,
    /// Relay state for alice's stream
    pub alice_ctx: RelayContext,
    /// Relay state for bob's stream
    pub bob_ctx: RelayContext,
    config: RelayConfig,
}

impl RelayedPair {
    /// Pair without direct-channel upgrades
    pub fn new() -> Self {
        Self::with_direct(None, None)
    }

    /// Pair with optional direct-channel upgrades per client
    pub fn with_direct(
        alice_direct: Option<DirectUpgrade>,
        bob_direct: Option<DirectUpgrade>,
    ) -> Self {
        crate::test_helpers::init_tracing();

        let config = RelayConfig::default();
        let relay = PeerId::random();
        let alice_id = PeerId::random();
        let bob_id = PeerId::random();

        let (alice_stream, alice_relay_side) = Duplex::pair(STREAM_CAPACITY);
        let (bob_stream, bob_relay_side) = Duplex::pair(STREAM_CAPACITY);

        let alice_ctx = RelayContext::new(alice_relay_side, &config);
        let bob_ctx = RelayContext::new(bob_relay_side, &config);
        RelayContext::pair(&alice_ctx, &bob_ctx).expect("fresh contexts");

        let alice = open_client(alice_stream, relay, alice_id, bob_id, alice_direct, &config);
        let bob = open_client(bob_stream, relay, bob_id, alice_id, bob_direct, &config);

        Self {
            relay,
            alice,
            bob,
            alice_ctx,
            bob_ctx,
            config,
        }
    }

    /// Replace alice's physical stream, as after a dropped link
    ///
    /// Alice redials with a fresh connection and the relay swaps the new
    /// stream into her context; bob learns about it through RESTART.
    pub fn redial_alice(&mut self) {
        let (stream, relay_side) = Duplex::pair(STREAM_CAPACITY);
        self.alice = open_client(
            stream,
            self.relay,
            self.alice.id,
            self.bob.id,
            None,
            &self.config,
        );
        self.alice_ctx.update(relay_side);
    }
}

impl Default for RelayedPair {
    fn default() -> Self {
        Self::new()
    }
}

fn open_client(
    stream: Duplex,
    relay: PeerId,
    local: PeerId,
    counterparty: PeerId,
    direct: Option<DirectUpgrade>,
    config: &RelayConfig,
) -> Client {
    let (reconnect_tx, reconnects) = mpsc::unbounded_channel();
    let on_reconnect: ReconnectHandler = std::sync::Arc::new(
        move |conn: RelayConnection, _peer: PeerId| -> ReconnectFuture {
            let tx = reconnect_tx.clone();
            Box::pin(async move {
                let _ = tx.send(conn);
            })
        },
    );

    let conn = RelayConnection::new(RelayConnectionOptions {
        stream,
        local,
        relay,
        counterparty,
        on_reconnect,
        direct,
        config: config.clone(),
    });

    Client {
        id: local,
        conn,
        reconnects,
    }
}
