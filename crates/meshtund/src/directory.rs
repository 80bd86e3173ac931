//! Static address directory built from the peer file

use crate::config::PeerFile;
use async_trait::async_trait;
use meshtun_core::PeerId;
use meshtun_net::routing::{DirectoryError, PeerDirectory, Resolution};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};

/// Overlay routes known up front
pub struct StaticDirectory {
    local: PeerId,
    address: IpAddr,
    routes: RwLock<HashMap<IpAddr, PeerId>>,
}

impl StaticDirectory {
    pub fn new(local: PeerId, address: IpAddr) -> Self {
        Self {
            local,
            address,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Directory holding every route in `file`
    pub fn from_peer_file(local: PeerId, address: IpAddr, file: &PeerFile) -> anyhow::Result<Self> {
        let directory = Self::new(local, address);
        for entry in &file.peers {
            let peer = entry.peer_id()?;
            for route in &entry.routes {
                directory.insert(*route, peer);
            }
        }
        Ok(directory)
    }

    pub fn insert(&self, addr: IpAddr, peer: PeerId) {
        self.routes.write().insert(addr, peer);
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    fn lookup(&self, addr: &IpAddr) -> Resolution {
        match self.routes.read().get(addr) {
            Some(peer) => Resolution::found(*peer),
            None => Resolution::unknown(),
        }
    }

    async fn request_resolution(&self, addr: IpAddr) -> Result<(), DirectoryError> {
        // Nothing to ask; the table only changes on restart
        debug!("No route for {}", addr);
        Ok(())
    }

    async fn announce_self(&self) -> Result<(), DirectoryError> {
        info!("Serving {} as {}", self.address, self.local);
        Ok(())
    }
}
