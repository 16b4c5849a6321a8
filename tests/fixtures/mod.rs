//! Reusable multi-party setups for integration tests

pub mod direct;
pub mod relayed_pair;

pub use direct::{LoopbackChannel, LoopbackEnd, LoopbackUpgrader, loopback_pair};
pub use relayed_pair::{Client, RelayedPair};
