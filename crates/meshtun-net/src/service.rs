//! Service entrypoint: wires the interface, router and reader tasks
//!
//! Two long-lived tasks run per service. The accept task hands every stream
//! a peer opens to its own reader task. The device task reads outbound
//! packets from the local device, routes them, and periodically retries the
//! ones that could not be sent.

use crate::config::InterfaceConfig;
use crate::crypto::KeyPair;
use crate::device::{DeviceFraming, DeviceReader, DeviceSink, DeviceWriter};
use crate::error::VpnError;
use crate::interface::{InterfaceStats, VpnInterface};
use crate::ring::RetryRing;
use crate::routing::{PeerDirectory, Router};
use crate::transport::{PeerHost, PeerStream};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The local device, split into its two directions
pub struct Device {
    pub reader: Box<dyn DeviceReader>,
    pub writer: Box<dyn DeviceWriter>,
    pub framing: DeviceFraming,
}

/// A configured, not yet started VPN service
pub struct VpnService {
    router: Arc<Router>,
    directory: Arc<dyn PeerDirectory>,
    reader: Box<dyn DeviceReader>,
    framing: DeviceFraming,
    cancel: CancellationToken,
}

impl VpnService {
    /// Build the service. Stops when `cancel` fires or the device closes.
    pub fn new(
        host: Arc<dyn PeerHost>,
        keypair: KeyPair,
        config: InterfaceConfig,
        device: Device,
        directory: Arc<dyn PeerDirectory>,
        cancel: &CancellationToken,
    ) -> Result<Self, VpnError> {
        config.validate()?;
        let cancel = cancel.child_token();
        let interface = VpnInterface::new(
            host,
            keypair,
            config,
            DeviceSink::new(device.writer, device.framing),
            cancel.clone(),
        );
        Ok(Self {
            router: Arc::new(Router::new(interface, directory.clone())),
            directory,
            reader: device.reader,
            framing: device.framing,
            cancel,
        })
    }

    pub fn interface(&self) -> &Arc<VpnInterface> {
        self.router.interface()
    }

    /// Announce ourselves and spawn the reader tasks
    pub async fn start(self, incoming: mpsc::Receiver<PeerStream>) -> Result<ServiceHandle, VpnError> {
        let interface = self.router.interface().clone();
        info!(peer = %interface.local_id(), mtu = interface.config().mtu, "starting VPN service");

        if let Err(e) = self.directory.announce_self().await {
            warn!("announce failed: {}", e);
        }

        let accept = tokio::spawn(accept_loop(
            interface.clone(),
            incoming,
            self.cancel.clone(),
        ));

        let cancel = self.cancel.clone();
        let device = tokio::spawn(async move {
            let result = device_loop(self.router, self.reader, self.framing, self.cancel.clone()).await;
            // Without a device there is nothing left to serve
            self.cancel.cancel();
            result
        });

        Ok(ServiceHandle {
            interface,
            device,
            accept,
            cancel,
        })
    }

    /// Start the service and wait until it stops.
    ///
    /// Returns early only on a setup error or a device failure.
    pub async fn run(self, incoming: mpsc::Receiver<PeerStream>) -> Result<(), VpnError> {
        self.start(incoming).await?.join().await
    }
}

/// Running service
pub struct ServiceHandle {
    interface: Arc<VpnInterface>,
    device: JoinHandle<Result<(), VpnError>>,
    accept: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ServiceHandle {
    pub fn interface(&self) -> &Arc<VpnInterface> {
        &self.interface
    }

    pub fn stats(&self) -> InterfaceStats {
        self.interface.stats()
    }

    /// Ask every task to stop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the service to stop
    pub async fn join(self) -> Result<(), VpnError> {
        let result = self.device.await?;
        self.accept.await?;
        info!(stats = ?self.interface.stats(), "VPN service stopped");
        result
    }
}

async fn accept_loop(
    interface: Arc<VpnInterface>,
    mut incoming: mpsc::Receiver<PeerStream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            stream = incoming.recv() => match stream {
                Some(stream) => {
                    interface.accept(stream);
                }
                None => {
                    debug!("transport stopped delivering streams");
                    break;
                }
            },
        }
    }
}

/// Read outbound packets from the device and route them.
///
/// Relies on `DeviceReader::read_frame` being cancel safe, since the retry
/// tick and cancellation race it.
async fn device_loop(
    router: Arc<Router>,
    mut reader: Box<dyn DeviceReader>,
    framing: DeviceFraming,
    cancel: CancellationToken,
) -> Result<(), VpnError> {
    let config = router.interface().config().clone();
    let mut buf = vec![0u8; config.device_buffer_len()];
    let mut ring = RetryRing::new(config.retry_capacity, config.retry_max_age);
    let mut retry = tokio::time::interval(config.retry_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = retry.tick(), if !ring.is_empty() => {
                let sent = ring
                    .drain_and_retry(|packet| {
                        let router = router.clone();
                        async move { router.route(packet).await.map(|_| ()) }
                    })
                    .await;
                if sent > 0 || !ring.is_empty() {
                    debug!(sent, queued = ring.len(), "retried queued packets");
                }
            }
            read = reader.read_frame(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        info!("device closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => return Err(VpnError::Device(e)),
                };
                let packet = match framing.strip(&buf[..n]) {
                    Ok(packet) => Bytes::copy_from_slice(packet),
                    Err(e) => {
                        debug!("skipping device frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = router.route(packet.clone()).await {
                    if e.is_retryable() {
                        ring.add(packet);
                    } else {
                        debug!("dropped outbound packet: {}", e);
                    }
                }
            }
        }
    }
    Ok(())
}
