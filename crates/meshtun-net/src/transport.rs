//! Peer transport seam
//!
//! The overlay transport (NAT traversal, multiplexing, discovery) lives
//! outside this crate. It hands us byte streams to peers through
//! [`PeerHost`] and delivers streams peers open to us as [`PeerStream`]s.

use async_trait::async_trait;
use meshtun_core::PeerId;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("could not open stream to {peer}: {source}")]
    Open { peer: PeerId, source: io::Error },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("stream closed")]
    Closed,
}

/// A bidirectional byte stream to one peer
pub struct PeerStream {
    /// Identity of the other end as the transport authenticated it
    pub remote: PeerId,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl PeerStream {
    pub fn new(remote: PeerId, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            remote,
            reader,
            writer,
        }
    }

    /// Split any duplex IO object into a peer stream
    pub fn from_io<S>(remote: PeerId, io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(remote, Box::new(reader), Box::new(writer))
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Overlay transport: who we are and how to reach a peer
#[async_trait]
pub trait PeerHost: Send + Sync {
    fn local_id(&self) -> PeerId;

    async fn open_stream(&self, peer: &PeerId) -> io::Result<PeerStream>;
}

/// Shared write half of a peer stream.
///
/// Writes are serialized so frames from concurrent writers never interleave.
pub struct StreamHandle {
    id: u64,
    remote: PeerId,
    writer: Mutex<Option<BoxedWriter>>,
}

impl StreamHandle {
    pub fn new(remote: PeerId, writer: BoxedWriter) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Process-unique stream id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Write one complete encoded frame within `timeout`
    pub async fn write_frame(&self, frame: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout {
                op: "stream write",
                after: timeout,
            }),
        }
    }

    /// Close the write half; later writes fail with `Closed`.
    pub async fn reset(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

/// In-process transport joining peers with `tokio::io::duplex` pipes
pub mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const PIPE_CAPACITY: usize = 256 * 1024;

    /// Registry of in-process peers
    #[derive(Default)]
    pub struct MemoryNetwork {
        peers: RwLock<HashMap<PeerId, mpsc::Sender<PeerStream>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Attach a peer; streams opened to it arrive on the returned receiver.
        pub fn join(self: &Arc<Self>, id: PeerId) -> (MemoryHost, mpsc::Receiver<PeerStream>) {
            let (tx, rx) = mpsc::channel(16);
            self.peers.write().insert(id, tx);
            (
                MemoryHost {
                    id,
                    network: self.clone(),
                },
                rx,
            )
        }

        /// Detach a peer; further opens to it fail.
        pub fn leave(&self, id: &PeerId) {
            self.peers.write().remove(id);
        }
    }

    /// One peer's view of a [`MemoryNetwork`]
    pub struct MemoryHost {
        id: PeerId,
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl PeerHost for MemoryHost {
        fn local_id(&self) -> PeerId {
            self.id
        }

        async fn open_stream(&self, peer: &PeerId) -> io::Result<PeerStream> {
            let tx = self
                .network
                .peers
                .read()
                .get(peer)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "peer not reachable"))?;

            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
            tx.send(PeerStream::from_io(self.id, theirs))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "peer gone"))?;
            Ok(PeerStream::from_io(*peer, ours))
        }
    }
}
