//! peerlan demo
//!
//! Runs a host and a member peer in one process, bridged over the loopback
//! overlay with memory TUN devices: the member joins the room, receives its
//! virtual IP, both routing tables converge, and one frame crosses each
//! way. A smoke run of the whole stack without touching the system.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use peerlan_core::{BridgeConfig, Role, VpnBridge};
use peerlan_network::overlay::LoopbackHub;
use peerlan_network::tun::memory_tun;
use peerlan_network::{LobbyEvent, PeerId, SessionManager, TunConfig};

/// peerlan loopback demo
#[derive(Parser)]
#[command(name = "peerlan-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Virtual subnet network address
    #[arg(long, default_value = "10.77.0.0")]
    subnet: Ipv4Addr,

    /// Subnet mask
    #[arg(long, default_value = "255.255.255.0")]
    netmask: Ipv4Addr,

    /// MTU of the virtual devices
    #[arg(long, default_value = "1400")]
    mtu: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = BridgeConfig {
        tun_name: String::new(),
        subnet: cli.subnet,
        netmask: cli.netmask,
        mtu: cli.mtu,
    };

    let hub = LoopbackHub::new();

    // Host side.
    let host_session = SessionManager::new(hub.endpoint(PeerId(1), "host"));
    let host_bridge = VpnBridge::new(host_session.clone(), config.clone(), Role::Host);
    let (host_device, host_os) = memory_tun(TunConfig {
        name: "demo-host".to_string(),
        mtu: config.mtu,
    });
    host_bridge.start_with_device(Arc::new(host_device)).await?;
    host_session.start();

    // Member side.
    let member_session = SessionManager::new(hub.endpoint(PeerId(2), "member"));
    let member_bridge = VpnBridge::new(member_session.clone(), config.clone(), Role::Member);
    let (member_device, member_os) = memory_tun(TunConfig {
        name: "demo-member".to_string(),
        mtu: config.mtu,
    });
    member_bridge
        .start_with_device(Arc::new(member_device))
        .await?;
    member_session.start();

    // The member enters the room and dials the peers it finds there.
    member_session.handle_lobby_event(LobbyEvent::Entered {
        members: vec![PeerId(1), PeerId(2)],
    });

    // Wait for the assignment to land.
    let member_ip = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ip) = member_bridge.local_ip() {
                break ip;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("member never received an IP assignment")?;

    let host_ip = host_bridge
        .local_ip()
        .context("host has no local IP after start")?;
    info!("host is {}, member was assigned {}", host_ip, member_ip);

    print_routes("host", &host_bridge);
    print_routes("member", &member_bridge);

    // One frame each way across the overlay.
    let request = ipv4_frame(member_ip, host_ip, 84);
    member_os.inject(&request);
    let delivered = tokio::time::timeout(Duration::from_secs(5), host_os.written())
        .await
        .context("frame never reached the host TUN")?
        .context("host TUN closed")?;
    info!(
        "member -> host: {} bytes delivered to {}",
        delivered.len(),
        host_ip
    );

    let reply = ipv4_frame(host_ip, member_ip, 84);
    host_os.inject(&reply);
    let returned = tokio::time::timeout(Duration::from_secs(5), member_os.written())
        .await
        .context("frame never reached the member TUN")?
        .context("member TUN closed")?;
    info!(
        "host -> member: {} bytes delivered to {}",
        returned.len(),
        member_ip
    );

    info!("host stats: {:?}", host_bridge.stats());
    info!("member stats: {:?}", member_bridge.stats());

    member_bridge.stop().await?;
    host_bridge.stop().await?;
    member_session.stop().await;
    host_session.stop().await;

    info!("demo complete");
    Ok(())
}

fn print_routes(label: &str, bridge: &VpnBridge) {
    let mut routes = bridge.routes().snapshot();
    routes.sort_by_key(|entry| entry.addr);
    info!("{} routing table:", label);
    for route in routes {
        info!(
            "  {} -> {} ({}{})",
            route.addr,
            route.display_name,
            route.peer,
            if route.is_local { ", local" } else { "" }
        );
    }
}

fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, total_len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; total_len.max(20)];
    frame[0] = 0x45;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame
}
