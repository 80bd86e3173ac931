//! meshtund - meshtun overlay VPN daemon
//!
//! This daemon provides:
//! - Command line and peer file configuration
//! - A TCP peer transport
//! - A UDP bridge to the TUN helper
//! - A static overlay address directory

pub mod config;
pub mod directory;
pub mod tcp;
pub mod udp_device;

pub use config::{Config, PeerFile};
pub use directory::StaticDirectory;
pub use tcp::TcpHost;
