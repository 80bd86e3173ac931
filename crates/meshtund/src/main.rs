//! meshtund - meshtun overlay VPN daemon
//!
//! Bridges a local TUN helper to the other nodes of the mesh, encrypting
//! every packet with a per peer-pair Noise session.

use anyhow::Context;
use clap::Parser;
use meshtund::config::{Config, PeerFile};
use meshtund::directory::StaticDirectory;
use meshtund::tcp::TcpHost;
use meshtund::udp_device;
use meshtun_net::{DeviceFraming, KeyPair, VpnService};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let default = if config.verbose {
        "meshtund=debug,meshtun_net=debug"
    } else {
        "meshtund=info,meshtun_net=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    config.validate()?;

    let keypair = match config.keypair()? {
        Some(keypair) => keypair,
        None => {
            let keypair = KeyPair::generate();
            warn!(
                "No private key configured, generated one (public key {})",
                hex::encode(keypair.public_key())
            );
            keypair
        }
    };
    let local = keypair.peer_id();
    info!("Local peer {} ({})", local, config.address);

    let peers = match &config.peers {
        Some(path) => PeerFile::load(path)?,
        None => PeerFile::default(),
    };

    let host = TcpHost::new(local);
    for entry in &peers.peers {
        host.add_peer(entry.peer_id()?, entry.endpoint);
    }
    let directory = StaticDirectory::from_peer_file(local, config.address, &peers)?;
    info!("{} peers, {} routes", peers.peers.len(), directory.len());

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("Listening on {}", config.listen);
    let incoming = TcpHost::spawn_listener(listener, cancel.clone());

    let device = udp_device::open(config.device_bind, config.device_peer, DeviceFraming::platform())
        .await
        .context("opening device bridge")?;

    let service = VpnService::new(
        Arc::new(host),
        keypair,
        config.interface_config(),
        device,
        Arc::new(directory),
        &cancel,
    )?;
    service.run(incoming).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    info!(
        "meshtund v{} - meshtun overlay VPN daemon",
        env!("CARGO_PKG_VERSION")
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    cancel.cancel();
                }
                Err(e) => warn!("Cannot listen for shutdown signal: {}", e),
            }
        }
    });

    if let Err(e) = run(config, cancel).await {
        error!("Daemon error: {:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
