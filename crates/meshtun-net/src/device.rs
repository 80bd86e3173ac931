//! Local virtual network device seam
//!
//! Opening and configuring the TUN device is the host's business. The
//! pipeline only needs to read outbound IP packets from it and write inbound
//! ones back, framed the way the host kernel expects.

use crate::error::VpnError;
use async_trait::async_trait;
use meshtun_core::packet::{tun_info_header, TUN_INFO_HEADER_SIZE};
use std::io;
use std::time::Duration;
use tokio::sync::Mutex;

/// Source of packets the local host wants sent into the overlay
#[async_trait]
pub trait DeviceReader: Send {
    /// Read one device frame into `buf`, returning its length.
    ///
    /// `Ok(0)` means the device closed.
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sink for packets arriving from the overlay
#[async_trait]
pub trait DeviceWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// How IP packets are framed on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFraming {
    /// Bare IP packets
    Raw,
    /// 4-byte address family header before every packet (utun style)
    InfoHeader,
}

impl DeviceFraming {
    /// Framing used by the host platform's TUN driver
    pub const fn platform() -> Self {
        if cfg!(any(target_os = "macos", target_os = "ios")) {
            DeviceFraming::InfoHeader
        } else {
            DeviceFraming::Raw
        }
    }

    pub const fn header_len(self) -> usize {
        match self {
            DeviceFraming::Raw => 0,
            DeviceFraming::InfoHeader => TUN_INFO_HEADER_SIZE,
        }
    }

    /// IP packet inside a frame read from the device
    pub fn strip<'a>(self, frame: &'a [u8]) -> Result<&'a [u8], VpnError> {
        let packet = frame.get(self.header_len()..).unwrap_or_default();
        if packet.is_empty() {
            return Err(VpnError::EmptyPacket);
        }
        Ok(packet)
    }

    /// Device frame carrying `packet`
    pub fn wrap(self, packet: &[u8]) -> Result<Vec<u8>, VpnError> {
        match self {
            DeviceFraming::Raw => Ok(packet.to_vec()),
            DeviceFraming::InfoHeader => {
                let header = tun_info_header(packet)?;
                let mut frame = Vec::with_capacity(TUN_INFO_HEADER_SIZE + packet.len());
                frame.extend_from_slice(&header);
                frame.extend_from_slice(packet);
                Ok(frame)
            }
        }
    }
}

impl Default for DeviceFraming {
    fn default() -> Self {
        Self::platform()
    }
}

/// Shared write side of the local device.
///
/// Every peer stream reader delivers here; the lock keeps frames whole.
pub struct DeviceSink {
    writer: Mutex<Box<dyn DeviceWriter>>,
    framing: DeviceFraming,
}

impl DeviceSink {
    pub fn new(writer: Box<dyn DeviceWriter>, framing: DeviceFraming) -> Self {
        Self {
            writer: Mutex::new(writer),
            framing,
        }
    }

    /// Write one IP packet to the device, giving up after `limit`.
    ///
    /// The limit covers waiting for other readers' writes too.
    pub async fn deliver(&self, packet: &[u8], limit: Duration) -> Result<(), VpnError> {
        if packet.is_empty() {
            return Err(VpnError::EmptyPacket);
        }
        let frame = self.framing.wrap(packet)?;
        let write = async {
            self.writer
                .lock()
                .await
                .write_frame(&frame)
                .await
                .map_err(VpnError::Device)
        };
        tokio::time::timeout(limit, write)
            .await
            .map_err(|_| VpnError::DeviceTimeout(limit))?
    }
}

/// Channel-backed device for tests and embedding
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// Reading half handed to the pipeline
    pub struct MemoryReader {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    /// Writing half handed to the pipeline
    pub struct MemoryWriter {
        tx: mpsc::Sender<Vec<u8>>,
    }

    /// The host's side: inject packets, observe deliveries
    pub struct DeviceTap {
        pub inject: mpsc::Sender<Vec<u8>>,
        pub delivered: mpsc::Receiver<Vec<u8>>,
    }

    /// Create a device whose channels each hold `capacity` frames
    pub fn device(capacity: usize) -> (MemoryReader, MemoryWriter, DeviceTap) {
        let (inject, rx) = mpsc::channel(capacity);
        let (tx, delivered) = mpsc::channel(capacity);
        (
            MemoryReader { rx },
            MemoryWriter { tx },
            DeviceTap { inject, delivered },
        )
    }

    #[async_trait]
    impl DeviceReader for MemoryReader {
        async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(frame) = self.rx.recv().await else {
                return Ok(0);
            };
            if frame.len() > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds buffer of {}", frame.len(), buf.len()),
                ));
            }
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
    }

    #[async_trait]
    impl DeviceWriter for MemoryWriter {
        async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.tx
                .send(frame.to_vec())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(1);

    fn ipv6_packet() -> Vec<u8> {
        let mut p = vec![0u8; 48];
        p[0] = 0x60;
        p
    }

    #[test]
    fn test_raw_framing() {
        let f = DeviceFraming::Raw;
        assert_eq!(f.wrap(&[0x45, 1, 2]).unwrap(), vec![0x45, 1, 2]);
        assert_eq!(f.strip(&[0x45, 1, 2]).unwrap(), &[0x45, 1, 2]);
        assert!(matches!(f.strip(&[]), Err(VpnError::EmptyPacket)));
    }

    #[test]
    fn test_info_header_framing() {
        let f = DeviceFraming::InfoHeader;
        let packet = ipv6_packet();
        let frame = f.wrap(&packet).unwrap();
        assert_eq!(frame.len(), packet.len() + 4);
        assert_eq!(&frame[..3], &[0, 0, 0]);
        assert_ne!(frame[3], 2);
        assert_eq!(f.strip(&frame).unwrap(), packet.as_slice());

        // Header only, or less
        assert!(f.strip(&frame[..4]).is_err());
        assert!(f.strip(&frame[..2]).is_err());
        assert!(f.wrap(&[0x30]).is_err());
    }

    #[tokio::test]
    async fn test_sink_delivers_framed() {
        let (_reader, writer, mut tap) = memory::device(4);
        let sink = DeviceSink::new(Box::new(writer), DeviceFraming::InfoHeader);

        let packet = vec![0x45; 20];
        sink.deliver(&packet, LIMIT).await.unwrap();
        let frame = tap.delivered.recv().await.unwrap();
        assert_eq!(frame[..4], [0, 0, 0, 2]);
        assert_eq!(&frame[4..], packet.as_slice());

        assert!(matches!(
            sink.deliver(&[], LIMIT).await,
            Err(VpnError::EmptyPacket)
        ));
    }

    struct StuckWriter;

    #[async_trait]
    impl DeviceWriter for StuckWriter {
        async fn write_frame(&mut self, _frame: &[u8]) -> io::Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_sink_write_is_bounded() {
        let sink = DeviceSink::new(Box::new(StuckWriter), DeviceFraming::Raw);
        let limit = Duration::from_millis(50);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            sink.deliver(&[0x45; 20], limit),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(VpnError::DeviceTimeout(d)) if d == limit));

        // The lock is released for the next writer
        assert!(matches!(
            sink.deliver(&[0x45; 20], limit).await,
            Err(VpnError::DeviceTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_reader() {
        let (mut reader, _writer, tap) = memory::device(4);
        tap.inject.send(vec![1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 2];
        assert!(reader.read_frame(&mut buf).await.is_err());

        tap.inject.send(vec![4, 5]).await.unwrap();
        assert_eq!(reader.read_frame(&mut buf).await.unwrap(), 2);
        assert_eq!(buf, [4, 5]);

        drop(tap);
        assert_eq!(reader.read_frame(&mut buf).await.unwrap(), 0);
    }
}
