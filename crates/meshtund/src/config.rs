//! Configuration for meshtund

use anyhow::Context;
use clap::Parser;
use meshtun_core::PeerId;
use meshtun_net::{HandshakePattern, InterfaceConfig, KeyPair};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// meshtund - meshtun overlay VPN daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "meshtund")]
#[command(about = "Peer-to-peer overlay VPN daemon")]
pub struct Config {
    /// Listen address for peer streams
    #[arg(short, long, default_value = "0.0.0.0:7420")]
    pub listen: SocketAddr,

    /// Overlay address of this node
    #[arg(short, long)]
    pub address: IpAddr,

    /// Pre-shared key phrase, identical on every node of the mesh
    #[arg(long, env = "MESHTUN_PSK", hide_env_values = true)]
    pub psk: String,

    /// Hex X25519 private key; a fresh one is generated when absent
    #[arg(long, env = "MESHTUN_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// JSON file listing the other nodes
    #[arg(short, long)]
    pub peers: Option<PathBuf>,

    /// Local UDP address the TUN helper sends packets to
    #[arg(long, default_value = "127.0.0.1:7421")]
    pub device_bind: SocketAddr,

    /// UDP address of the TUN helper
    #[arg(long, default_value = "127.0.0.1:7422")]
    pub device_peer: SocketAddr,

    /// Interface MTU
    #[arg(long, default_value = "1420")]
    pub mtu: usize,

    /// Handshake pattern (anonymous or known)
    #[arg(long, default_value = "anonymous")]
    pub pattern: HandshakePattern,

    /// Trace every frame header
    #[arg(long)]
    pub log_packets: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.psk.is_empty() {
            anyhow::bail!("Pre-shared key cannot be empty");
        }
        if let Some(key) = &self.private_key {
            parse_key(key).context("invalid private key")?;
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        self.interface_config().validate()?;
        Ok(())
    }

    /// Identity keypair from the configured key, if one is set
    pub fn keypair(&self) -> anyhow::Result<Option<KeyPair>> {
        self.private_key
            .as_deref()
            .map(|key| Ok(KeyPair::from_private_key(parse_key(key)?)))
            .transpose()
    }

    pub fn interface_config(&self) -> InterfaceConfig {
        let mut config = InterfaceConfig::new(self.psk.clone())
            .with_mtu(self.mtu)
            .with_pattern(self.pattern);
        config.log_packets = self.log_packets;
        config
    }
}

fn parse_key(hex_key: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("expected 32 bytes, got {}", b.len()))
}

/// Known nodes, as listed in the peer file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerFile {
    pub peers: Vec<PeerEntry>,
}

/// One remote node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Hex X25519 public key
    pub public_key: String,
    /// Where its daemon listens
    pub endpoint: SocketAddr,
    /// Overlay addresses it owns
    #[serde(default)]
    pub routes: Vec<IpAddr>,
}

impl PeerEntry {
    pub fn peer_id(&self) -> anyhow::Result<PeerId> {
        Ok(PeerId::from_public_key(&parse_key(&self.public_key)?))
    }
}

impl PeerFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading peer file {}", path.display()))?;
        let file: PeerFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing peer file {}", path.display()))?;
        for entry in &file.peers {
            entry
                .peer_id()
                .with_context(|| format!("peer at {}", entry.endpoint))?;
        }
        Ok(file)
    }
}
