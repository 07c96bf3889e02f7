use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::sync::Arc;
use tunward_core::{init_logging, Config, RouteTable, TrafficStats};
use tunward_netstack::{TunDevice, TunnelStack};

/// Tunward - user-space SOCKS5 tunnel router over a TUN device
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Override: SOCKS5 server address
    #[arg(long)]
    server: Option<String>,

    /// Override: SOCKS5 server port
    #[arg(long)]
    port: Option<u16>,

    /// Override: block all UDP traffic
    #[arg(long)]
    block_udp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let content = fs::read_to_string(&args.config)
        .with_context(|| format!("Failed to read config file {}", args.config))?;
    let mut config = Config::from_yaml(&content)?;

    if let Some(server) = args.server {
        config.server.address = server;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.block_udp {
        config.tunnel.block_udp = true;
    }
    config.validate()?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    init_logging(config.log_level)?;
    tunward_core::clear_logs();

    let config = Arc::new(config);
    let routes = Arc::new(RouteTable::from_config(&config.routes));
    let stats = Arc::new(TrafficStats::new());

    tracing::info!(
        "Connecting via SOCKS5 server {}:{}",
        config.server.address,
        config.server.port
    );

    let mut device = TunDevice::new(config.tunnel.clone());
    device.start().await.context("Failed to start TUN device")?;

    let frame_tx = device.frame_sender()?;
    let device_rx = device
        .take_frame_receiver()
        .context("TUN device receiver already taken")?;

    let stack = Arc::new(TunnelStack::new(
        config.clone(),
        routes,
        stats.clone(),
        frame_tx,
    ));

    stack
        .probe_server()
        .await
        .context("SOCKS5 server unreachable")?;

    stack.start();

    let dispatch = {
        let stack = stack.clone();
        tokio::spawn(async move { stack.run(device_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    stack.shutdown();
    device.stop().await;
    let _ = dispatch.await;

    tracing::info!("Session totals: {}", stats.snapshot());
    Ok(())
}
