//! Local device bridged over UDP
//!
//! The daemon does not open the TUN device itself. A small privileged
//! helper owns it and relays each packet as one UDP datagram, in both
//! directions, to a socket on the loopback interface.

use async_trait::async_trait;
use meshtun_net::device::{DeviceFraming, DeviceReader, DeviceWriter};
use meshtun_net::Device;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::info;

struct UdpReader {
    socket: Arc<UdpSocket>,
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl DeviceReader for UdpReader {
    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // A zero-length datagram would read as end of device
        loop {
            let n = self.socket.recv(buf).await?;
            if n > 0 {
                return Ok(n);
            }
        }
    }
}

#[async_trait]
impl DeviceWriter for UdpWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).await?;
        Ok(())
    }
}

/// Bind `bind`, connect it to the helper at `helper`, and split the socket
/// into the two device directions.
pub async fn open(bind: SocketAddr, helper: SocketAddr, framing: DeviceFraming) -> io::Result<Device> {
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(helper).await?;
    info!("Device bridge on {} relaying to {}", socket.local_addr()?, helper);

    let socket = Arc::new(socket);
    Ok(Device {
        reader: Box::new(UdpReader {
            socket: socket.clone(),
        }),
        writer: Box::new(UdpWriter { socket }),
        framing,
    })
}
