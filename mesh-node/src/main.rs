// meshchat node: peer transport, presence, local store and chat console.

mod config;
mod console;
mod driver;
mod identity;
mod mute;
mod presence;
mod store;
mod transport;

use std::time::Instant;

use anyhow::Context;
use mesh_core::MeshCore;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut relay_port = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("mesh-node {}", VERSION);
                return Ok(());
            }
            "--relay" => {
                let port = args.next().context("--relay needs a port")?;
                relay_port = Some(port.parse::<u16>().context("invalid relay port")?);
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    if let Some(port) = relay_port {
        return rt.block_on(async {
            tokio::select! {
                r = presence::run_relay(port) => r.context("presence relay"),
                r = shutdown_signal() => r,
            }
        });
    }

    let cfg = config::load();
    let identity = identity::load_or_create(&cfg.data_dir)?;
    tracing::info!(%identity, name = %cfg.name, data_dir = %cfg.data_dir.display(), "starting");
    let store = store::JsonStore::open(cfg.data_dir.join("store.json"), cfg.history_limit);
    let objects = store::FileObjects::open(cfg.data_dir.join("objects"));
    let mut core = MeshCore::new(
        identity.clone(),
        cfg.name.clone(),
        cfg.mesh.clone(),
        Box::new(store),
        Box::new(objects),
        Instant::now(),
    );
    if !cfg.muted.is_empty() {
        tracing::info!(count = cfg.muted.len(), "muting senders");
        core.register_interceptor(Box::new(mute::Muted::new(cfg.muted.iter().cloned())));
    }

    rt.block_on(async {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = watch::channel(identity);

        let listen_port = cfg.listen_port;
        let listener_events = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::run_listener(listen_port, local_rx, listener_events).await {
                tracing::error!(error = %e, "peer listener stopped");
            }
        });
        tokio::spawn(console::run(events_tx.clone()));

        let driver = driver::Driver::new(core, &cfg, events_tx, local_tx);
        tokio::select! {
            _ = driver.run(events_rx) => {}
            r = shutdown_signal() => r?,
        }
        tracing::info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
