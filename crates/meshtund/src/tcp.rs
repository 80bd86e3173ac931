//! TCP peer transport
//!
//! Each stream starts with the opener's 38-byte peer id so the listening
//! side knows who is on the other end. Authentication is left to the Noise
//! handshake that follows.

use async_trait::async_trait;
use meshtun_core::{PeerId, PEER_ID_SIZE};
use meshtun_net::transport::{PeerHost, PeerStream};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer transport over plain TCP connections
pub struct TcpHost {
    local: PeerId,
    endpoints: RwLock<HashMap<PeerId, SocketAddr>>,
    connect_timeout: Duration,
}

impl TcpHost {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            endpoints: RwLock::new(HashMap::new()),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Record where `peer` listens
    pub fn add_peer(&self, peer: PeerId, endpoint: SocketAddr) {
        self.endpoints.write().insert(peer, endpoint);
    }

    pub fn endpoint(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.endpoints.read().get(peer).copied()
    }

    /// Accept connections on `listener` until cancelled, delivering each as
    /// a peer stream once its hello arrives.
    pub fn spawn_listener(
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PeerStream> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                match read_hello(stream).await {
                                    Ok(peer_stream) => {
                                        let _ = tx.send(peer_stream).await;
                                    }
                                    Err(e) => debug!("Dropping connection from {}: {}", addr, e),
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    },
                }
            }
            info!("Listener stopped");
        });
        rx
    }
}

async fn read_hello(mut stream: TcpStream) -> io::Result<PeerStream> {
    stream.set_nodelay(true)?;
    let mut hello = [0u8; PEER_ID_SIZE];
    tokio::time::timeout(HELLO_TIMEOUT, stream.read_exact(&mut hello))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no hello"))??;
    Ok(PeerStream::from_io(PeerId(hello), stream))
}

#[async_trait]
impl PeerHost for TcpHost {
    fn local_id(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: &PeerId) -> io::Result<PeerStream> {
        let endpoint = self.endpoint(peer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no endpoint for {peer}"))
        })?;
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        stream.write_all(self.local.as_bytes()).await?;
        Ok(PeerStream::from_io(*peer, stream))
    }
}
