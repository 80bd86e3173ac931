//! Raw IP packet inspection

use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Size of the address family header some platforms prepend to TUN frames
pub const TUN_INFO_HEADER_SIZE: usize = 4;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Address family values as the host kernel numbers them
#[cfg(any(target_os = "macos", target_os = "ios"))]
mod af {
    pub const INET: u8 = 2;
    pub const INET6: u8 = 30;
}

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
mod af {
    pub const INET: u8 = 2;
    pub const INET6: u8 = 28;
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
mod af {
    pub const INET: u8 = 2;
    pub const INET6: u8 = 10;
}

/// IP version nibble of the first byte, if any
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

fn checked_version(packet: &[u8]) -> Result<u8> {
    let version = ip_version(packet).ok_or(Error::TruncatedIpPacket { version: 0, len: 0 })?;
    let required = match version {
        4 => IPV4_HEADER_LEN,
        6 => IPV6_HEADER_LEN,
        other => return Err(Error::UnsupportedIpVersion(other)),
    };
    if packet.len() < required {
        return Err(Error::TruncatedIpPacket {
            version,
            len: packet.len(),
        });
    }
    Ok(version)
}

fn v4(bytes: &[u8]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn v6(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// Destination address from the IP header
pub fn destination(packet: &[u8]) -> Result<IpAddr> {
    match checked_version(packet)? {
        4 => Ok(v4(&packet[16..20])),
        _ => Ok(v6(&packet[24..40])),
    }
}

/// Source address from the IP header
pub fn source(packet: &[u8]) -> Result<IpAddr> {
    match checked_version(packet)? {
        4 => Ok(v4(&packet[12..16])),
        _ => Ok(v6(&packet[8..24])),
    }
}

/// Platform info header identifying the packet's address family
pub fn tun_info_header(packet: &[u8]) -> Result<[u8; TUN_INFO_HEADER_SIZE]> {
    match ip_version(packet) {
        Some(4) => Ok([0, 0, 0, af::INET]),
        Some(6) => Ok([0, 0, 0, af::INET6]),
        Some(other) => Err(Error::UnsupportedIpVersion(other)),
        None => Err(Error::TruncatedIpPacket { version: 0, len: 0 }),
    }
}
