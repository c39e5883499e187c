use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use skein::config::Config;
use skein::device::TunDevice;
use skein::gate::DialGate;
use skein::rpc::{self, ControlListener};
use skein::supervisor::Supervisor;
use skein::transport::QuicUnderlay;

#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(author, version, about = "Encrypted overlay network daemon", long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/skein/skein0.json")]
    config: PathBuf,

    /// Name of the TUN interface to create.
    #[arg(short, long, default_value = "skein0")]
    interface: String,

    /// Control channel: unix:<path> or tcp:<loopback addr>.
    #[arg(long)]
    rpc: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&args.config, &args.interface)?;
    info!(node = %config.self_id, config = %args.config.display(), "configuration loaded");

    let device = create_device(&args.interface).await?;

    let gate = DialGate::new(config.state.clone());
    let underlay = QuicUnderlay::bind(
        &config.keypair,
        &config.listen_addresses,
        config.address_book.clone(),
        gate,
    )
    .await
    .context("failed to start underlay transport")?;

    let supervisor = Supervisor::new(&config, underlay, device);
    supervisor.start().await.context("failed to start overlay")?;

    let listener = match &args.rpc {
        Some(spec) => ControlListener::from_spec(spec, &args.interface)?,
        None => ControlListener::default_for(&args.interface),
    };
    {
        let supervisor = supervisor.clone();
        let shutdown = shutdown_receiver(&supervisor);
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(supervisor, listener, shutdown).await {
                warn!(error = %e, "control channel failed");
            }
        });
    }

    wait_for_signals(&supervisor).await;
    supervisor.shutdown().await;
    Ok(())
}

async fn create_device(interface: &str) -> Result<Arc<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        let tun = skein::device::LinuxTun::create(interface)
            .await
            .context("failed to create TUN interface")?;
        Ok(Arc::new(tun))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = interface;
        anyhow::bail!("no TUN backend for this platform");
    }
}

fn shutdown_receiver(supervisor: &Arc<Supervisor>) -> tokio::sync::watch::Receiver<bool> {
    supervisor.shutdown_watch()
}

/// Block until a termination signal; SIGUSR1 triggers rediscovery instead.
async fn wait_for_signals(supervisor: &Arc<Supervisor>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut rediscover =
            signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    return;
                }
                _ = terminate.recv() => {
                    info!("terminated, shutting down");
                    return;
                }
                _ = rediscover.recv() => {
                    info!("SIGUSR1, triggering rediscovery");
                    supervisor.rediscover();
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted, shutting down");
    }
}
