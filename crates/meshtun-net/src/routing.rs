//! Destination resolution for outbound packets
//!
//! Mapping overlay IP addresses to peer identities is owned by an external
//! directory (DHT, broadcast discovery, static table). The [`Router`] asks it
//! for every packet and, on a miss, requests a resolution at most once per
//! debounce window.

use crate::error::VpnError;
use crate::interface::VpnInterface;
use async_trait::async_trait;
use bytes::Bytes;
use meshtun_core::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Prune the debounce table once it holds this many addresses
const DEBOUNCE_PRUNE_AT: usize = 1024;

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Answer to a directory lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub peer: Option<PeerId>,
    /// The directory already has a query for this address in flight
    pub recently_queried: bool,
}

impl Resolution {
    pub fn found(peer: PeerId) -> Self {
        Self {
            peer: Some(peer),
            recently_queried: false,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Overlay address directory
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Current mapping for `addr`, without blocking
    fn lookup(&self, addr: &IpAddr) -> Resolution;

    /// Ask the overlay who owns `addr`
    async fn request_resolution(&self, addr: IpAddr) -> Result<(), DirectoryError>;

    /// Tell the overlay which addresses this peer owns
    async fn announce_self(&self) -> Result<(), DirectoryError>;
}

/// Outbound routing: IP destination to peer, then hand-off to the interface
pub struct Router {
    interface: Arc<VpnInterface>,
    directory: Arc<dyn PeerDirectory>,
    debounce: Duration,
    last_request: Mutex<HashMap<IpAddr, Instant>>,
}

impl Router {
    pub fn new(interface: Arc<VpnInterface>, directory: Arc<dyn PeerDirectory>) -> Self {
        Self {
            debounce: interface.config().lookup_debounce,
            interface,
            directory,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn interface(&self) -> &Arc<VpnInterface> {
        &self.interface
    }

    /// Route one raw IP packet, returning the peer it was sent to.
    ///
    /// An unresolved destination yields [`VpnError::DestinationUnknown`]
    /// after scheduling a resolution request in the background.
    pub async fn route(&self, packet: Bytes) -> Result<PeerId, VpnError> {
        let dst = meshtun_core::packet::destination(&packet)?;
        let resolution = self.directory.lookup(&dst);

        let Some(peer) = resolution.peer else {
            if !resolution.recently_queried && self.should_request(dst, Instant::now()) {
                self.spawn_request(dst);
            }
            return Err(VpnError::DestinationUnknown(dst));
        };

        trace!(%dst, %peer, len = packet.len(), "routing packet");
        self.interface.send(peer, packet).await?;
        Ok(peer)
    }

    /// Record a request for `addr` unless one went out within the window
    fn should_request(&self, addr: IpAddr, now: Instant) -> bool {
        let mut last = self.last_request.lock();
        if let Some(at) = last.get(&addr) {
            if now.saturating_duration_since(*at) < self.debounce {
                return false;
            }
        }
        if last.len() >= DEBOUNCE_PRUNE_AT {
            let debounce = self.debounce;
            last.retain(|_, at| now.saturating_duration_since(*at) < debounce);
        }
        last.insert(addr, now);
        true
    }

    fn spawn_request(&self, addr: IpAddr) {
        let directory = self.directory.clone();
        debug!(%addr, "requesting resolution");
        tokio::spawn(async move {
            if let Err(e) = directory.request_resolution(addr).await {
                debug!(%addr, "resolution request failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::crypto::KeyPair;
    use crate::device::{memory, DeviceFraming, DeviceSink};
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::TransportError;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MockDirectory {
        table: Mutex<HashMap<IpAddr, PeerId>>,
        in_flight: Mutex<bool>,
        requests: Mutex<Vec<IpAddr>>,
    }

    #[async_trait]
    impl PeerDirectory for MockDirectory {
        fn lookup(&self, addr: &IpAddr) -> Resolution {
            Resolution {
                peer: self.table.lock().get(addr).copied(),
                recently_queried: *self.in_flight.lock(),
            }
        }

        async fn request_resolution(&self, addr: IpAddr) -> Result<(), DirectoryError> {
            self.requests.lock().push(addr);
            Ok(())
        }

        async fn announce_self(&self) -> Result<(), DirectoryError> {
            Ok(())
        }
    }

    fn router(config: InterfaceConfig) -> (Router, Arc<MockDirectory>) {
        let network = MemoryNetwork::new();
        let keys = KeyPair::generate();
        let (host, _incoming) = network.join(keys.peer_id());
        let (_reader, writer, _tap) = memory::device(4);
        let iface = VpnInterface::new(
            Arc::new(host),
            keys,
            config,
            DeviceSink::new(Box::new(writer), DeviceFraming::Raw),
            CancellationToken::new(),
        );
        let directory = Arc::new(MockDirectory::default());
        (Router::new(iface, directory.clone()), directory)
    }

    fn packet_to(dst: [u8; 4]) -> Bytes {
        let mut p = vec![0u8; 40];
        p[0] = 0x45;
        p[16..20].copy_from_slice(&dst);
        Bytes::from(p)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_unknown_destination_is_debounced() {
        let (router, directory) = router(InterfaceConfig::new("k"));

        for _ in 0..3 {
            let err = router.route(packet_to([10, 0, 0, 5])).await.unwrap_err();
            assert!(matches!(err, VpnError::DestinationUnknown(ip) if ip == IpAddr::from([10, 0, 0, 5])));
        }
        router.route(packet_to([10, 0, 0, 6])).await.unwrap_err();
        settle().await;

        assert_eq!(
            *directory.requests.lock(),
            vec![IpAddr::from([10, 0, 0, 5]), IpAddr::from([10, 0, 0, 6])]
        );
    }

    #[tokio::test]
    async fn test_debounce_window_expires() {
        let (router, _directory) = router(InterfaceConfig::new("k"));
        let addr = IpAddr::from([10, 0, 0, 5]);
        let start = Instant::now();

        assert!(router.should_request(addr, start));
        assert!(!router.should_request(addr, start + Duration::from_secs(4)));
        assert!(router.should_request(addr, start + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_in_flight_query_is_not_repeated() {
        let (router, directory) = router(InterfaceConfig::new("k"));
        *directory.in_flight.lock() = true;

        router.route(packet_to([10, 0, 0, 5])).await.unwrap_err();
        settle().await;
        assert!(directory.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resolved_destination_is_sent() {
        let (router, directory) = router(InterfaceConfig::new("k"));
        let peer = PeerId::from_public_key(&[4; 32]);
        directory
            .table
            .lock()
            .insert(IpAddr::from([10, 0, 0, 5]), peer);

        // Resolved, but the peer is not on the network
        let err = router.route(packet_to([10, 0, 0, 5])).await.unwrap_err();
        assert!(matches!(
            err,
            VpnError::Transport(TransportError::Open { peer: p, .. }) if p == peer
        ));
        assert!(directory.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_packet() {
        let (router, _directory) = router(InterfaceConfig::new("k"));
        let err = router.route(Bytes::from_static(&[0x45, 0, 0])).await.unwrap_err();
        assert!(matches!(err, VpnError::Wire(_)));
    }
}
