//! VPN interface: frame dispatch and the outbound send path
//!
//! Every peer stream gets one reader task that owns a [`FramingEngine`] and
//! feeds it through [`VpnInterface::ingest`]. HANDSHAKE frames are answered
//! on the stream they arrived on; DATA frames are opened by the transform
//! chain and written to the local device.
//!
//! Sending to a peer without a session opens a fresh stream, runs the
//! initiator side of the handshake on it, then sends the DATA frame.

use crate::chain::{PacketLogger, TransformChain};
use crate::compress::Compressor;
use crate::config::InterfaceConfig;
use crate::crypto::{Handshake, HandshakeError, KeyPair, PreSharedKey, SessionCipher};
use crate::device::DeviceSink;
use crate::error::VpnError;
use crate::framing::FramingEngine;
use crate::seal::NoiseSealer;
use crate::session::{Session, SessionKey, SessionMap};
use crate::transport::{BoxedReader, PeerHost, PeerStream, StreamHandle, TransportError};
use bytes::Bytes;
use meshtun_core::{FrameType, PeerId, WirePacket, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 16 * 1024;

/// What happened to one complete frame
#[derive(Debug)]
pub enum FrameOutcome {
    /// DATA frame opened and written to the device (plaintext length)
    Delivered(usize),
    /// HANDSHAKE answered; the peer's inbound session is ready
    HandshakeCompleted(PeerId),
    /// Frame discarded
    Dropped(VpnError),
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handshakes: AtomicU64,
}

/// Interface statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub handshakes: u64,
    /// Outbound DATA frames a transform stage emptied
    pub degraded: u64,
    pub sessions: usize,
    pub ready_sessions: usize,
}

/// One VPN interface bound to a local identity
pub struct VpnInterface {
    host: Arc<dyn PeerHost>,
    local: PeerId,
    keypair: KeyPair,
    psk: PreSharedKey,
    config: InterfaceConfig,
    sessions: Arc<SessionMap>,
    chain: TransformChain,
    device: DeviceSink,
    counters: Counters,
    /// Serializes outbound session setup so one peer gets one stream
    dialing: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl VpnInterface {
    pub fn new(
        host: Arc<dyn PeerHost>,
        keypair: KeyPair,
        config: InterfaceConfig,
        device: DeviceSink,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionMap::new());
        let mut chain = TransformChain::new();
        if config.log_packets {
            chain = chain.with(PacketLogger);
        }
        let chain = chain
            .with(NoiseSealer::new(sessions.clone()))
            .with(Compressor::new(config.max_payload));

        let local = host.local_id();
        if local != keypair.peer_id() {
            warn!(host = %local, key = %keypair.peer_id(), "transport identity differs from identity key");
        }
        debug!(stages = ?chain.stage_names(), "transform chain ready");

        Arc::new(Self {
            host,
            local,
            psk: PreSharedKey::derive(&config.pre_shared_key),
            keypair,
            config,
            sessions,
            chain,
            device,
            counters: Counters::default(),
            dialing: tokio::sync::Mutex::new(()),
            cancel,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionMap> {
        &self.sessions
    }

    pub fn stats(&self) -> InterfaceStats {
        let c = &self.counters;
        InterfaceStats {
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_out: c.frames_out.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            handshakes: c.handshakes.load(Ordering::Relaxed),
            degraded: self.chain.degraded_count(),
            sessions: self.sessions.len(),
            ready_sessions: self.sessions.ready_count(),
        }
    }

    fn new_engine(&self) -> FramingEngine {
        FramingEngine::new(self.config.max_payload)
    }

    /// Feed bytes read from `origin` and dispatch every frame they complete.
    ///
    /// Per-frame failures come back as [`FrameOutcome::Dropped`]. An `Err`
    /// means the stream itself is unusable.
    pub async fn ingest(
        &self,
        engine: &mut FramingEngine,
        origin: &Arc<StreamHandle>,
        bytes: &[u8],
    ) -> Result<Vec<FrameOutcome>, VpnError> {
        engine.push(bytes);
        let mut outcomes = Vec::new();
        while let Some(frame) = engine.next_frame()? {
            outcomes.push(self.dispatch(frame, origin).await);
        }
        Ok(outcomes)
    }

    async fn dispatch(&self, frame: WirePacket, origin: &Arc<StreamHandle>) -> FrameOutcome {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        let remote = frame.header.src;

        let result = match frame.frame_type() {
            FrameType::Handshake => self
                .on_handshake(frame, origin)
                .await
                .map(FrameOutcome::HandshakeCompleted),
            FrameType::Data => self.on_data(frame, origin).await.map(FrameOutcome::Delivered),
        };

        result.unwrap_or_else(|e| {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %remote, stream = origin.id(), "dropped frame: {}", e);
            FrameOutcome::Dropped(e)
        })
    }

    fn check_addressing(&self, frame: &WirePacket) -> Result<(), VpnError> {
        if frame.header.version != PROTOCOL_VERSION {
            return Err(VpnError::UnsupportedVersion(frame.header.version));
        }
        if frame.header.dst != self.local {
            return Err(VpnError::Misrouted {
                dst: frame.header.dst,
            });
        }
        Ok(())
    }

    /// A stream only carries frames from the peer it was opened with
    fn check_source(frame: &WirePacket, origin: &StreamHandle) -> Result<(), VpnError> {
        if frame.header.src != origin.remote() {
            return Err(VpnError::SpoofedSource {
                claimed: frame.header.src,
                stream_peer: origin.remote(),
            });
        }
        Ok(())
    }

    /// Answer a peer's first handshake message on the stream it came in on
    async fn on_handshake(
        &self,
        frame: WirePacket,
        origin: &Arc<StreamHandle>,
    ) -> Result<PeerId, VpnError> {
        self.check_addressing(&frame)?;
        Self::check_source(&frame, origin)?;
        let remote = frame.header.src;
        let key = SessionKey::inbound(&self.local, &remote);

        // A ready session keeps its stream until that stream's reader exits
        if self.sessions.get(&key).is_some_and(|s| s.is_ready()) {
            return Err(HandshakeError::AlreadyComplete.into());
        }
        self.sessions.create(key.clone(), origin.clone());

        let answered = async {
            let mut handshake =
                Handshake::receiver(self.config.pattern, &self.keypair, &remote, &self.psk)?;
            let response = handshake
                .step(Some(&frame.payload()[..]))?
                .ok_or_else(|| VpnError::aborted(remote, "no response produced"))?;
            let cipher = Arc::new(SessionCipher::new(handshake)?);

            self.sessions.upgrade(key.clone(), origin.clone(), cipher);
            let reply = WirePacket::handshake(response, remote, self.local);
            origin
                .write_frame(&reply.encode(), self.config.write_timeout)
                .await?;
            Ok::<_, VpnError>(())
        }
        .await;

        if let Err(e) = answered {
            self.sessions.delete_stream(&key, origin.id());
            return Err(e);
        }
        self.counters.handshakes.fetch_add(1, Ordering::Relaxed);
        info!(peer = %remote, stream = origin.id(), "inbound session established");
        Ok(remote)
    }

    /// Open a DATA frame and write its packet to the device
    async fn on_data(&self, frame: WirePacket, origin: &Arc<StreamHandle>) -> Result<usize, VpnError> {
        self.check_addressing(&frame)?;
        Self::check_source(&frame, origin)?;
        let remote = frame.header.src;

        let packet = match self.chain.inbound(frame) {
            Ok(packet) => packet,
            Err(e) => {
                let e = VpnError::from(e);
                if !e.is_recoverable() {
                    warn!(peer = %remote, "tearing down inbound session: {}", e);
                    self.sessions
                        .delete_stream(&SessionKey::inbound(&self.local, &remote), origin.id());
                }
                return Err(e);
            }
        };

        let payload = packet.into_payload();
        self.device
            .deliver(&payload, self.config.write_timeout)
            .await?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(payload.len())
    }

    /// Send one raw IP packet to `remote`, setting up a session first if
    /// there is none.
    ///
    /// A failed write tears the session down; the next send to the same
    /// peer handshakes again.
    pub async fn send(self: &Arc<Self>, remote: PeerId, packet: Bytes) -> Result<(), VpnError> {
        if packet.is_empty() {
            return Err(VpnError::EmptyPacket);
        }
        let key = SessionKey::outbound(&self.local, &remote);
        let stream = match self.sessions.get(&key) {
            Some(session) if session.is_ready() => session.stream,
            _ => self.initiate(remote, &key).await?,
        };

        let frame = self
            .chain
            .outbound(WirePacket::data(packet, remote, self.local));
        if let Err(e) = stream
            .write_frame(&frame.encode(), self.config.write_timeout)
            .await
        {
            warn!(peer = %remote, stream = stream.id(), "write failed, tearing down session: {}", e);
            self.teardown(&key, &stream).await;
            return Err(e.into());
        }
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn teardown(&self, key: &SessionKey, stream: &Arc<StreamHandle>) {
        self.sessions.delete_stream(key, stream.id());
        stream.reset().await;
    }

    /// Open a stream to `remote` and complete the initiator handshake on it
    async fn initiate(
        self: &Arc<Self>,
        remote: PeerId,
        key: &SessionKey,
    ) -> Result<Arc<StreamHandle>, VpnError> {
        let _dialing = self.dialing.lock().await;
        if let Some(session) = self.sessions.get(key).filter(Session::is_ready) {
            return Ok(session.stream);
        }

        let limit = self.config.handshake_timeout;
        let stream = tokio::time::timeout(limit, self.host.open_stream(&remote))
            .await
            .map_err(|_| TransportError::Timeout {
                op: "open stream",
                after: limit,
            })?
            .map_err(|source| TransportError::Open {
                peer: remote,
                source,
            })?;

        let PeerStream { reader, writer, .. } = stream;
        let handle = Arc::new(StreamHandle::new(remote, writer));
        self.sessions.create(key.clone(), handle.clone());
        debug!(peer = %remote, stream = handle.id(), "starting handshake");

        let outcome = match tokio::time::timeout(limit, self.handshake(remote, &handle, reader)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                op: "handshake",
                after: limit,
            }
            .into()),
        };

        match outcome {
            Ok((cipher, engine, reader)) => {
                self.sessions
                    .upgrade(key.clone(), handle.clone(), Arc::new(cipher));
                self.counters.handshakes.fetch_add(1, Ordering::Relaxed);
                info!(peer = %remote, stream = handle.id(), "outbound session established");
                tokio::spawn(self.clone().serve_stream(handle.clone(), reader, engine));
                Ok(handle)
            }
            Err(e) => {
                warn!(peer = %remote, "handshake failed: {}", e);
                self.teardown(key, &handle).await;
                Err(e)
            }
        }
    }

    /// Initiator side of the two-message exchange.
    ///
    /// Returns the reader and its engine too, since bytes after the
    /// response may already be buffered.
    async fn handshake(
        &self,
        remote: PeerId,
        handle: &Arc<StreamHandle>,
        mut reader: BoxedReader,
    ) -> Result<(SessionCipher, FramingEngine, BoxedReader), VpnError> {
        let mut handshake =
            Handshake::initiator(self.config.pattern, &self.keypair, &remote, &self.psk)?;
        let first = handshake
            .step(None)?
            .ok_or_else(|| VpnError::aborted(remote, "no initial message produced"))?;
        handle
            .write_frame(
                &WirePacket::handshake(first, remote, self.local).encode(),
                self.config.write_timeout,
            )
            .await?;

        let mut engine = self.new_engine();
        let response = engine
            .read_frame(&mut reader)
            .await?
            .ok_or_else(|| VpnError::aborted(remote, "stream closed before response"))?;
        if response.frame_type() != FrameType::Handshake {
            return Err(VpnError::UnexpectedFrame(response.frame_type()));
        }
        self.check_addressing(&response)?;
        if response.header.src != remote {
            return Err(VpnError::aborted(remote, "response from a different peer"));
        }

        handshake.step(Some(&response.payload()[..]))?;
        Ok((SessionCipher::new(handshake)?, engine, reader))
    }

    /// Start serving a stream a peer opened to us
    pub fn accept(self: &Arc<Self>, stream: PeerStream) -> JoinHandle<()> {
        let PeerStream {
            remote,
            reader,
            writer,
        } = stream;
        let handle = Arc::new(StreamHandle::new(remote, writer));
        debug!(peer = %remote, stream = handle.id(), "accepted stream");
        tokio::spawn(self.clone().serve_stream(handle, reader, self.new_engine()))
    }

    /// Reader loop for one stream.
    ///
    /// Exits on cancellation, end of stream, or an unrecoverable error, then
    /// removes every session bound to the stream before closing it.
    async fn serve_stream(
        self: Arc<Self>,
        handle: Arc<StreamHandle>,
        mut reader: BoxedReader,
        mut engine: FramingEngine,
    ) {
        let remote = handle.remote();
        let mut buf = vec![0u8; READ_CHUNK];

        // Bytes buffered during the handshake may already hold frames
        let mut pending: Option<usize> = (engine.buffered() > 0).then_some(0);

        loop {
            let n = match pending.take() {
                Some(n) => n,
                None => tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => {
                            debug!(peer = %remote, stream = handle.id(), "stream closed by peer");
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            debug!(peer = %remote, stream = handle.id(), "stream read failed: {}", e);
                            break;
                        }
                    },
                },
            };

            let ingested = tokio::select! {
                _ = self.cancel.cancelled() => break,
                ingested = self.ingest(&mut engine, &handle, &buf[..n]) => ingested,
            };
            match ingested {
                Ok(outcomes) => {
                    let fatal = outcomes.iter().find_map(|o| match o {
                        FrameOutcome::Dropped(e) if !e.is_recoverable() => Some(e),
                        _ => None,
                    });
                    if let Some(e) = fatal {
                        warn!(peer = %remote, stream = handle.id(), "closing stream: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer = %remote, stream = handle.id(), "closing stream: {}", e);
                    break;
                }
            }
        }

        let purged = self.sessions.purge_stream(handle.id());
        if !purged.is_empty() {
            info!(peer = %remote, sessions = purged.len(), "sessions closed with stream");
        }
        handle.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TransformStage;
    use crate::crypto::HandshakePattern;
    use crate::device::memory::{self, DeviceTap};
    use crate::device::{DeviceFraming, DeviceWriter};
    use crate::transport::memory::{MemoryHost, MemoryNetwork};
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn ip_packet(dst_last: u8, len: usize) -> Vec<u8> {
        let mut p = vec![0u8; len];
        p[0] = 0x45;
        p[16..20].copy_from_slice(&[10, 9, 0, dst_last]);
        for (i, b) in p.iter_mut().enumerate().skip(20) {
            *b = (i % 251) as u8;
        }
        p
    }

    struct Node {
        keys: KeyPair,
        iface: Arc<VpnInterface>,
        tap: DeviceTap,
        incoming: mpsc::Receiver<PeerStream>,
    }

    fn node(network: &Arc<MemoryNetwork>, config: InterfaceConfig) -> Node {
        let (_reader, writer, tap) = memory::device(16);
        let (keys, iface, incoming) =
            node_with_device(network, config, Box::new(writer), CancellationToken::new());
        Node {
            keys,
            iface,
            tap,
            incoming,
        }
    }

    fn node_with_device(
        network: &Arc<MemoryNetwork>,
        config: InterfaceConfig,
        writer: Box<dyn DeviceWriter>,
        cancel: CancellationToken,
    ) -> (KeyPair, Arc<VpnInterface>, mpsc::Receiver<PeerStream>) {
        let keys = KeyPair::generate();
        let (host, incoming): (MemoryHost, _) = network.join(keys.peer_id());
        let iface = VpnInterface::new(
            Arc::new(host),
            keys.clone(),
            config,
            DeviceSink::new(writer, DeviceFraming::Raw),
            cancel,
        );
        (keys, iface, incoming)
    }

    /// Device whose writes never complete
    struct StuckWriter;

    #[async_trait]
    impl DeviceWriter for StuckWriter {
        async fn write_frame(&mut self, _frame: &[u8]) -> io::Result<()> {
            std::future::pending().await
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn first_message(from: &KeyPair, to: &PeerId) -> Vec<u8> {
        let psk = PreSharedKey::derive("mesh");
        let mut initiator =
            Handshake::initiator(HandshakePattern::Anonymous, from, to, &psk).unwrap();
        initiator.step(None).unwrap().unwrap()
    }

    /// Raw end of a stream plus the handle the interface writes to
    fn loose_stream(remote: PeerId) -> (Arc<StreamHandle>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (Arc::new(StreamHandle::new(remote, Box::new(ours))), theirs)
    }

    #[tokio::test]
    async fn test_first_send_handshakes_then_sends_data() {
        let network = MemoryNetwork::new();
        let config = InterfaceConfig::new("mesh");
        let a = node(&network, config.clone());

        // B is played by hand
        let kb = KeyPair::generate();
        let (_host_b, mut incoming_b) = network.join(kb.peer_id());
        let b = kb.peer_id();

        let packet = ip_packet(2, 120);
        let sender = {
            let iface = a.iface.clone();
            let packet = Bytes::from(packet.clone());
            tokio::spawn(async move { iface.send(b, packet).await })
        };

        let mut stream = incoming_b.recv().await.unwrap();
        assert_eq!(stream.remote, a.keys.peer_id());
        let mut engine = FramingEngine::new(config.max_payload);

        let first = engine.read_frame(&mut stream.reader).await.unwrap().unwrap();
        assert_eq!(first.frame_type(), FrameType::Handshake);
        assert_eq!(first.header.src, a.keys.peer_id());
        assert_eq!(first.header.dst, b);

        let psk = PreSharedKey::derive("mesh");
        let mut receiver =
            Handshake::receiver(HandshakePattern::Anonymous, &kb, &first.header.src, &psk).unwrap();
        let response = receiver.step(Some(&first.payload()[..])).unwrap().unwrap();
        let reply = WirePacket::handshake(response, first.header.src, b);
        stream.writer.write_all(&reply.encode()).await.unwrap();

        let data = engine.read_frame(&mut stream.reader).await.unwrap().unwrap();
        assert_eq!(data.frame_type(), FrameType::Data);
        assert_ne!(data.payload().as_ref(), packet.as_slice());

        let sealed = receiver.decrypt(data.payload()).unwrap();
        let opened = Compressor::new(config.max_payload)
            .inbound(WirePacket::data(sealed, b, first.header.src))
            .unwrap();
        assert_eq!(opened.payload().as_ref(), packet.as_slice());

        sender.await.unwrap().unwrap();
        let stats = a.iface.stats();
        assert_eq!(stats.handshakes, 1);
        assert_eq!(stats.frames_out, 1);
        assert_eq!(stats.ready_sessions, 1);
    }

    #[tokio::test]
    async fn test_two_interfaces_exchange_packets() {
        let network = MemoryNetwork::new();
        let config = InterfaceConfig::new("mesh");
        let a = node(&network, config.clone());
        let mut b = node(&network, config);

        let b_iface = b.iface.clone();
        let mut incoming = b.incoming;
        tokio::spawn(async move {
            while let Some(stream) = incoming.recv().await {
                b_iface.accept(stream);
            }
        });

        let b_id = b.keys.peer_id();
        for i in 0..3 {
            let packet = ip_packet(2, 60 + i * 100);
            a.iface.send(b_id, packet.clone().into()).await.unwrap();
            let got = tokio::time::timeout(Duration::from_secs(2), b.tap.delivered.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, packet);
        }

        assert_eq!(a.iface.stats().handshakes, 1);
        assert_eq!(b.iface.stats().delivered, 3);
        assert_eq!(b.iface.stats().handshakes, 1);
        drop(a.tap);
    }

    #[tokio::test]
    async fn test_corrupted_ciphertext_is_dropped() {
        let network = MemoryNetwork::new();
        let config = InterfaceConfig::new("mesh");
        let mut b = node(&network, config.clone());
        let b_id = b.keys.peer_id();

        let ka = KeyPair::generate();
        let a_id = ka.peer_id();
        let (origin, mut far_end) = loose_stream(a_id);
        let mut engine = b.iface.new_engine();

        // A's half of the handshake, by hand
        let psk = PreSharedKey::derive("mesh");
        let mut initiator =
            Handshake::initiator(HandshakePattern::Anonymous, &ka, &b_id, &psk).unwrap();
        let first = initiator.step(None).unwrap().unwrap();
        let outcomes = b
            .iface
            .ingest(&mut engine, &origin, &WirePacket::handshake(first, b_id, a_id).encode())
            .await
            .unwrap();
        assert!(matches!(outcomes[..], [FrameOutcome::HandshakeCompleted(p)] if p == a_id));

        let mut reply_engine = FramingEngine::new(config.max_payload);
        let reply = reply_engine.read_frame(&mut far_end).await.unwrap().unwrap();
        initiator.step(Some(&reply.payload()[..])).unwrap();

        let a_sessions = Arc::new(SessionMap::new());
        a_sessions.upgrade(
            SessionKey::outbound(&a_id, &b_id),
            origin.clone(),
            Arc::new(SessionCipher::new(initiator).unwrap()),
        );
        let a_chain = TransformChain::new()
            .with(NoiseSealer::new(a_sessions))
            .with(Compressor::new(config.max_payload));

        // One good frame
        let packet = ip_packet(2, 80);
        let sent = a_chain.outbound(WirePacket::data(packet.clone(), b_id, a_id));
        let outcomes = b.iface.ingest(&mut engine, &origin, &sent.encode()).await.unwrap();
        assert!(matches!(outcomes[..], [FrameOutcome::Delivered(80)]));
        assert_eq!(b.tap.delivered.recv().await.unwrap(), packet);

        // Then one tampered after encryption
        let sent = a_chain.outbound(WirePacket::data(packet.clone(), b_id, a_id));
        let mut bytes = sent.encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let outcomes = b.iface.ingest(&mut engine, &origin, &bytes).await.unwrap();
        assert!(matches!(
            outcomes[..],
            [FrameOutcome::Dropped(VpnError::Chain(crate::chain::ChainError::Decrypt(_)))]
        ));
        assert!(b.tap.delivered.try_recv().is_err());
        assert_eq!(b.iface.stats().dropped, 1);
        assert!(b.iface.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_psk_handshake_is_dropped() {
        let network = MemoryNetwork::new();
        let b = node(&network, InterfaceConfig::new("right"));
        let b_id = b.keys.peer_id();
        let ka = KeyPair::generate();
        let (origin, _far_end) = loose_stream(ka.peer_id());

        let mut initiator = Handshake::initiator(
            HandshakePattern::Anonymous,
            &ka,
            &b_id,
            &PreSharedKey::derive("wrong"),
        )
        .unwrap();
        let first = initiator.step(None).unwrap().unwrap();
        let mut engine = b.iface.new_engine();
        let outcomes = b
            .iface
            .ingest(
                &mut engine,
                &origin,
                &WirePacket::handshake(first, b_id, ka.peer_id()).encode(),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcomes[..],
            [FrameOutcome::Dropped(VpnError::Handshake(_))]
        ));
        assert!(b.iface.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_misrouted_and_sessionless_frames() {
        let network = MemoryNetwork::new();
        let b = node(&network, InterfaceConfig::new("mesh"));
        let b_id = b.keys.peer_id();
        let a_id = PeerId::from_public_key(&[7; 32]);
        let (origin, _far_end) = loose_stream(a_id);
        let mut engine = b.iface.new_engine();

        let mut bytes = bytes::BytesMut::new();
        WirePacket::data(vec![1, 2, 3], a_id, a_id).encode_into(&mut bytes);
        WirePacket::data(vec![1, 2, 3], b_id, a_id).encode_into(&mut bytes);

        let outcomes = b.iface.ingest(&mut engine, &origin, &bytes).await.unwrap();
        assert!(matches!(
            outcomes[..],
            [
                FrameOutcome::Dropped(VpnError::Misrouted { .. }),
                FrameOutcome::Dropped(VpnError::Chain(crate::chain::ChainError::SessionNotFound(_)))
            ]
        ));
        assert_eq!(b.iface.stats().frames_in, 2);
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_fails() {
        let network = MemoryNetwork::new();
        let a = node(&network, InterfaceConfig::new("mesh"));
        let nobody = PeerId::from_public_key(&[9; 32]);

        let err = a
            .iface
            .send(nobody, Bytes::from(ip_packet(1, 40)))
            .await
            .unwrap_err();
        assert!(matches!(err, VpnError::Transport(TransportError::Open { .. })));
        assert!(err.is_retryable());
        assert!(a.iface.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_tears_down() {
        let network = MemoryNetwork::new();
        let mut config = InterfaceConfig::new("mesh");
        config.handshake_timeout = Duration::from_millis(100);
        let a = node(&network, config);

        // Joined but never answers
        let silent = PeerId::from_public_key(&[8; 32]);
        let (_host, _incoming) = network.join(silent);

        let err = a
            .iface
            .send(silent, Bytes::from(ip_packet(1, 40)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VpnError::Transport(TransportError::Timeout { op: "handshake", .. })
        ));
        assert!(a.iface.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_ready_session_keeps_its_stream() {
        let network = MemoryNetwork::new();
        let b = node(&network, InterfaceConfig::new("mesh"));
        let b_id = b.keys.peer_id();
        let ka = KeyPair::generate();
        let a_id = ka.peer_id();
        let key = SessionKey::inbound(&b_id, &a_id);

        let (first, _first_end) = loose_stream(a_id);
        let mut engine = b.iface.new_engine();
        let hello = WirePacket::handshake(first_message(&ka, &b_id), b_id, a_id).encode();
        let outcomes = b.iface.ingest(&mut engine, &first, &hello).await.unwrap();
        assert!(matches!(outcomes[..], [FrameOutcome::HandshakeCompleted(p)] if p == a_id));

        // Same peer again on a second stream while the first is alive
        let (second, _second_end) = loose_stream(a_id);
        let mut second_engine = b.iface.new_engine();
        let again = WirePacket::handshake(first_message(&ka, &b_id), b_id, a_id).encode();
        let outcomes = b
            .iface
            .ingest(&mut second_engine, &second, &again)
            .await
            .unwrap();
        assert!(matches!(
            outcomes[..],
            [FrameOutcome::Dropped(VpnError::Handshake(HandshakeError::AlreadyComplete))]
        ));
        assert_eq!(b.iface.sessions().get(&key).unwrap().stream.id(), first.id());

        // Another peer's stream claiming to be A
        let km = KeyPair::generate();
        let (mallory, _mallory_end) = loose_stream(km.peer_id());
        let mut mallory_engine = b.iface.new_engine();
        let mut forged = bytes::BytesMut::new();
        WirePacket::handshake(first_message(&km, &b_id), b_id, a_id).encode_into(&mut forged);
        WirePacket::data(vec![0x45; 20], b_id, a_id).encode_into(&mut forged);
        let outcomes = b
            .iface
            .ingest(&mut mallory_engine, &mallory, &forged)
            .await
            .unwrap();
        assert!(matches!(
            outcomes[..],
            [
                FrameOutcome::Dropped(VpnError::SpoofedSource { .. }),
                FrameOutcome::Dropped(VpnError::SpoofedSource { .. })
            ]
        ));
        let session = b.iface.sessions().get(&key).unwrap();
        assert!(session.is_ready());
        assert_eq!(session.stream.id(), first.id());

        // Once the first stream is gone the peer may handshake afresh
        b.iface.sessions().purge_stream(first.id());
        let retry = WirePacket::handshake(first_message(&ka, &b_id), b_id, a_id).encode();
        let outcomes = b
            .iface
            .ingest(&mut second_engine, &second, &retry)
            .await
            .unwrap();
        assert!(matches!(outcomes[..], [FrameOutcome::HandshakeCompleted(p)] if p == a_id));
        assert_eq!(b.iface.sessions().get(&key).unwrap().stream.id(), second.id());
    }

    #[tokio::test]
    async fn test_stuck_device_write_times_out() {
        let network = MemoryNetwork::new();
        let a = node(&network, InterfaceConfig::new("mesh"));
        let mut config = InterfaceConfig::new("mesh");
        config.write_timeout = Duration::from_millis(100);
        let (kb, b_iface, mut b_incoming) = node_with_device(
            &network,
            config,
            Box::new(StuckWriter),
            CancellationToken::new(),
        );
        let b_id = kb.peer_id();

        let sender = {
            let iface = a.iface.clone();
            tokio::spawn(async move { iface.send(b_id, Bytes::from(ip_packet(2, 60))).await })
        };
        let _serving = b_iface.accept(b_incoming.recv().await.unwrap());
        sender.await.unwrap().unwrap();

        wait_until(|| b_iface.stats().dropped == 1).await;
        let stats = b_iface.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.ready_sessions, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stuck_delivery() {
        let network = MemoryNetwork::new();
        let a = node(&network, InterfaceConfig::new("mesh"));
        let mut config = InterfaceConfig::new("mesh");
        config.write_timeout = Duration::from_secs(60);
        let cancel = CancellationToken::new();
        let (kb, b_iface, mut b_incoming) =
            node_with_device(&network, config, Box::new(StuckWriter), cancel.clone());
        let b_id = kb.peer_id();

        let sender = {
            let iface = a.iface.clone();
            tokio::spawn(async move { iface.send(b_id, Bytes::from(ip_packet(2, 60))).await })
        };
        let serving = b_iface.accept(b_incoming.recv().await.unwrap());
        sender.await.unwrap().unwrap();

        // Handshake plus the DATA frame now blocked on the device
        wait_until(|| b_iface.stats().frames_in == 2).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(b_iface.sessions().is_empty());
    }
}
