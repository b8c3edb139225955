//! netplane CLI
//!
//! Inspect the host's routes, or bring a tunnel profile up and hold it
//! until interrupted.

use std::path::{Path, PathBuf};
use std::slice;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use netplane::{default_driver, Config, ContextOptions, Discovery, NetworkContext, TunnelConfig};

/// netplane - reversible host network changes for tunnel clients
#[derive(Parser)]
#[command(name = "netplane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the tunnel profile
    #[arg(short, long, default_value = "netplane.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the discovered default routes
    Show,

    /// Apply the profile, wait for a signal, then restore the host
    Up,

    /// Generate a sample profile
    GenConfig {
        /// Output path for the profile
        #[arg(short, long, default_value = "netplane.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Show => show().await,
        Commands::Up => up(&cli.config).await,
        Commands::GenConfig { output } => generate_config(&output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn show() -> Result<()> {
    let driver = default_driver();
    info!("Discovering routes with the {} driver", driver.name());
    let discovery = Discovery::spawn(driver);
    let state = discovery.wait().await.context("Route discovery failed")?;
    print!("{}", state);
    Ok(())
}

async fn up(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let tunnel = config.tunnel_config()?.clone();
    info!("Profile loaded from {:?}", config_path);

    let discovery = Discovery::spawn(default_driver());
    let ctx = NetworkContext::with_options(&discovery, ContextOptions::from(&config))
        .await
        .context("Failed to initialize network context")?;
    match ctx.default_gateway() {
        Some(gw) => info!("Default gateway {}", gw),
        None => warn!("No default gateway discovered"),
    }

    if let Err(e) = apply_profile(&ctx, &tunnel).await {
        error!("Failed to apply profile: {:#}", e);
        ctx.clear().await;
        return Err(e);
    }
    info!("Tunnel {} is up", tunnel.interface);

    wait_for_shutdown().await?;

    info!("Restoring network settings...");
    ctx.clear().await;
    Ok(())
}

async fn apply_profile(ctx: &NetworkContext, tunnel: &TunnelConfig) -> Result<()> {
    if tunnel.disable_ipv6 {
        ctx.disable_ipv6().await.context("Failed to disable IPv6")?;
    }

    let routes = ctx.new_route_manager().await?;
    let iface = routes
        .new_routable_interface(&tunnel.interface, &tunnel.address.to_string())
        .await
        .with_context(|| format!("Failed to configure {}", tunnel.interface))?;
    routes
        .add_external_route_to_ips(&tunnel.external_ips)
        .await
        .context("Failed to route external addresses")?;
    if tunnel.make_default {
        iface
            .make_default_route()
            .await
            .context("Failed to make the tunnel the default route")?;
    }

    let dns = ctx.new_dns_manager().await?;
    dns.add_dns_servers(&tunnel.dns_servers)
        .await
        .context("Failed to set DNS servers")?;
    dns.add_search_domains(&tunnel.search_domains)
        .await
        .context("Failed to set search domains")?;

    if !tunnel.has_filter_policy() {
        return Ok(());
    }
    let router = routes
        .new_filter_router()
        .await
        .context("Failed to initialize packet filter")?;
    // Each router call commits over a blocking netlink socket.
    let policy = tunnel.clone();
    let summary = tokio::task::spawn_blocking(move || -> Result<String> {
        for entry in &policy.security_groups {
            router.set_security_groups(entry.interface.as_deref(), slice::from_ref(&entry.group))?;
        }
        for pf in &policy.port_forwards {
            router.add_port_forward(pf.clone())?;
        }
        for tf in &policy.traffic_forwards {
            router.add_traffic_forward(tf.clone())?;
        }
        Ok(router.to_string())
    })
    .await
    .context("Packet filter task panicked")??;
    info!("Packet filter: {}", summary);
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load profile from {:?}", path))
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write profile to {:?}", output))?;

    info!("Generated sample profile at {:?}", output);
    println!("Sample profile written to {:?}", output);
    println!("\nEdit the tunnel interface and address before running `netplane up`.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
