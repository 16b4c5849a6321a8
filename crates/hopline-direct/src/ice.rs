//! Bounded registry of STUN servers for direct-channel attempts.
//!
//! Public nodes announced by the discovery layer become candidate STUN
//! servers. The registry keeps the most recently discovered ones first, never
//! reorders an address it already knows, and caps the list length.
//!
//! Readers get an immutable snapshot, so a direct-channel attempt never sees
//! a half-updated list.

use hopline_core::{AddrError, IceSettings, PeerAddr};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use hopline_core::config::MAX_STUN_SERVERS;

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URL, e.g. `stun:1.2.3.4:3478`
    pub urls: String,
}

/// Configuration handed to a new direct-channel attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    /// Servers to use, most recently discovered first
    pub ice_servers: Vec<IceServer>,
}

/// STUN URL of an address, if it names a usable UDP endpoint
///
/// The endpoint needs a specified IP and a non-zero port.
#[must_use]
pub fn stun_url(addr: &PeerAddr) -> Option<String> {
    let endpoint = usable_endpoint(addr)?;
    Some(format!("stun:{endpoint}"))
}

fn usable_endpoint(addr: &PeerAddr) -> Option<SocketAddr> {
    let endpoint = addr.udp_endpoint()?;
    if endpoint.ip().is_unspecified() || endpoint.port() == 0 {
        return None;
    }
    Some(endpoint)
}

/// Process-wide list of candidate STUN servers
#[derive(Debug)]
pub struct IceServerRegistry {
    entries: RwLock<Arc<Vec<SocketAddr>>>,
    max: usize,
}

impl IceServerRegistry {
    /// Create a registry seeded with `initial`, keeping their order
    ///
    /// Unusable addresses are skipped.
    #[must_use]
    pub fn new(initial: &[PeerAddr], max: usize) -> Self {
        let mut entries: Vec<SocketAddr> = Vec::new();
        for endpoint in initial.iter().filter_map(usable_endpoint) {
            if !entries.contains(&endpoint) {
                entries.push(endpoint);
            }
        }
        entries.truncate(max);

        Self {
            entries: RwLock::new(Arc::new(entries)),
            max,
        }
    }

    /// Create a registry from configuration
    ///
    /// # Errors
    ///
    /// Returns [`AddrError`] if an initial server does not parse.
    pub fn from_settings(settings: &IceSettings) -> Result<Self, AddrError> {
        let initial = settings
            .initial_servers
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<PeerAddr>, _>>()?;
        Ok(Self::new(&initial, settings.max_stun_servers))
    }

    /// Record a newly discovered public node
    ///
    /// Returns `true` if the registry changed.
    pub fn on_public_node_discovered(&self, addr: &PeerAddr) -> bool {
        let Some(endpoint) = usable_endpoint(addr) else {
            tracing::trace!(%addr, "not a usable STUN endpoint, ignoring");
            return false;
        };

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if entries.contains(&endpoint) {
            return false;
        }

        let mut next = Vec::with_capacity(entries.len() + 1);
        next.push(endpoint);
        next.extend(entries.iter().copied());
        next.truncate(self.max);
        *entries = Arc::new(next);

        tracing::debug!(%endpoint, count = entries.len(), "added STUN server");
        true
    }

    /// Current server list
    #[must_use]
    pub fn snapshot(&self) -> IceConfig {
        let entries = self.current();
        IceConfig {
            ice_servers: entries
                .iter()
                .map(|endpoint| IceServer {
                    urls: format!("stun:{endpoint}"),
                })
                .collect(),
        }
    }

    /// Number of known servers
    #[must_use]
    pub fn len(&self) -> usize {
        self.current().len()
    }

    /// Returns `true` if no server is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Consume discovery notifications until the sender goes away
    pub fn listen(self: Arc<Self>, mut discovered: mpsc::Receiver<PeerAddr>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(addr) = discovered.recv().await {
                self.on_public_node_discovered(&addr);
            }
            tracing::debug!("discovery notifier closed");
        })
    }

    fn current(&self) -> Arc<Vec<SocketAddr>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for IceServerRegistry {
    fn default() -> Self {
        Self::new(&[], MAX_STUN_SERVERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopline_core::PeerId;

    fn udp(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    fn urls(registry: &IceServerRegistry) -> Vec<String> {
        registry
            .snapshot()
            .ice_servers
            .into_iter()
            .map(|server| server.urls)
            .collect()
    }

    #[test]
    fn test_most_recent_first() {
        let registry = IceServerRegistry::default();

        assert!(registry.on_public_node_discovered(&udp("/ip4/1.2.3.4/udp/12345")));
        assert_eq!(urls(&registry), ["stun:1.2.3.4:12345"]);

        assert!(registry.on_public_node_discovered(&udp("/ip4/1.2.3.5/udp/12345")));
        assert_eq!(urls(&registry), ["stun:1.2.3.5:12345", "stun:1.2.3.4:12345"]);
    }

    #[test]
    fn test_duplicate_is_noop() {
        let registry = IceServerRegistry::default();
        let addr = udp("/ip4/1.2.3.4/udp/12345");

        registry.on_public_node_discovered(&addr);
        registry.on_public_node_discovered(&udp("/ip4/1.2.3.5/udp/1"));
        assert!(!registry.on_public_node_discovered(&addr));

        assert_eq!(urls(&registry), ["stun:1.2.3.5:1", "stun:1.2.3.4:12345"]);
    }

    #[test]
    fn test_initial_servers_kept_behind_new_ones() {
        let registry = IceServerRegistry::new(&[udp("/ip4/1.2.3.4/udp/12345")], MAX_STUN_SERVERS);
        assert_eq!(urls(&registry), ["stun:1.2.3.4:12345"]);

        registry.on_public_node_discovered(&udp("/ip4/1.2.3.5/udp/12345"));
        assert_eq!(urls(&registry), ["stun:1.2.3.5:12345", "stun:1.2.3.4:12345"]);
    }

    #[test]
    fn test_unusable_addresses_ignored() {
        let registry = IceServerRegistry::default();

        assert!(!registry.on_public_node_discovered(&PeerAddr::Peer(PeerId::random())));
        assert!(!registry.on_public_node_discovered(&udp("/ip6/::/udp/12345")));
        assert!(!registry.on_public_node_discovered(&udp("/ip4/1.2.3.4/tcp/12345")));
        assert!(!registry.on_public_node_discovered(&udp("/ip4/1.2.3.4/udp/0")));
        assert!(!registry.on_public_node_discovered(&PeerAddr::circuit(
            PeerId::random(),
            PeerId::random()
        )));

        assert!(registry.is_empty());
        assert_eq!(registry.snapshot(), IceConfig::default());
    }

    #[test]
    fn test_ipv6_url() {
        let addr = udp("/ip6/2001:db8::1/udp/3478");
        assert_eq!(stun_url(&addr).unwrap(), "stun:[2001:db8::1]:3478");
    }

    #[test]
    fn test_bounded() {
        let registry = IceServerRegistry::default();

        for i in 0..=MAX_STUN_SERVERS {
            let addr = udp(&format!("/ip4/1.2.3.4/udp/{}", i + 1));
            registry.on_public_node_discovered(&addr);

            if i < MAX_STUN_SERVERS {
                assert_eq!(registry.len(), i + 1);
                assert_eq!(urls(&registry)[0], stun_url(&addr).unwrap());
            }
        }

        let all = urls(&registry);
        assert_eq!(all.len(), MAX_STUN_SERVERS);
        assert_eq!(all[0], format!("stun:1.2.3.4:{}", MAX_STUN_SERVERS + 1));
        // Oldest entry was evicted
        assert!(!all.contains(&"stun:1.2.3.4:1".to_string()));
    }

    #[test]
    fn test_snapshot_is_stable() {
        let registry = IceServerRegistry::default();
        registry.on_public_node_discovered(&udp("/ip4/1.2.3.4/udp/1"));

        let before = registry.snapshot();
        registry.on_public_node_discovered(&udp("/ip4/1.2.3.4/udp/2"));

        assert_eq!(before.ice_servers.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_from_settings() {
        let settings = IceSettings {
            max_stun_servers: 1,
            initial_servers: vec![
                "/ip4/10.0.0.1/udp/3478".to_string(),
                "/ip4/10.0.0.2/udp/3478".to_string(),
            ],
        };
        let registry = IceServerRegistry::from_settings(&settings).unwrap();
        assert_eq!(urls(&registry), ["stun:10.0.0.1:3478"]);

        let bad = IceSettings {
            initial_servers: vec!["/dns4/example.com/udp/1".to_string()],
            ..IceSettings::default()
        };
        assert!(IceServerRegistry::from_settings(&bad).is_err());
    }

    #[test]
    fn test_ice_config_json_shape() {
        let registry = IceServerRegistry::new(&[udp("/ip4/1.2.3.4/udp/9")], 4);
        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "iceServers": [{ "urls": "stun:1.2.3.4:9" }] })
        );
    }

    #[tokio::test]
    async fn test_listen() {
        let registry = Arc::new(IceServerRegistry::default());
        let (tx, rx) = mpsc::channel(4);
        let task = registry.clone().listen(rx);

        tx.send(udp("/ip4/1.2.3.4/udp/7")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(urls(&registry), ["stun:1.2.3.4:7"]);
    }
}
