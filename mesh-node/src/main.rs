//! Mesh peer daemon: peer transport, presence beacons, hub listener, loopback range server and a terminal front end.

mod config;
mod console;
mod host;
mod http;
mod presence;
mod transport;

use std::path::Path;

use anyhow::Context;
use mesh_core::{MemoryStore, Node, PeerId};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PEER_ID_FILE: &str = "peer_id";

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let peer_id = load_peer_id(&cfg.data_dir)?;
    info!(peer = %peer_id, version = VERSION, locator = %cfg.locator(), "starting");
    let node = Node::new(
        peer_id,
        cfg.display_name.clone(),
        Some(cfg.locator()),
        cfg.mesh.clone(),
        Box::new(MemoryStore::new()),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let host = host::Host::new(node, cfg.clone(), presence_tx, app_tx);

        let listener = tokio::spawn(transport::run_listener(host.clone()));
        let presence_host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = presence::run_presence(presence_host, presence_rx).await {
                warn!(error = %e, "presence channel unavailable, relying on hubs");
            }
        });
        let http_host = host.clone();
        tokio::spawn(async move {
            if let Err(e) = http::run_http(http_host).await {
                warn!(error = %e, "range server unavailable");
            }
        });
        tokio::spawn(host::run_timers(host.clone()));
        tokio::spawn(console::run_events(cfg.clone(), app_rx));
        tokio::spawn(console::run_console(host.clone()));

        tokio::select! {
            joined = listener => match joined {
                Ok(res) => res.context("peer transport"),
                Err(e) => Err(e.into()),
            },
            res = shutdown_signal() => {
                info!("shutting down");
                res
            }
        }
    })
}

/// Peer id survives restarts so undelivered envelopes and announcements keep their sender.
fn load_peer_id(dir: &Path) -> anyhow::Result<PeerId> {
    let path = dir.join(PEER_ID_FILE);
    if let Ok(s) = std::fs::read_to_string(&path) {
        let s = s.trim();
        if !s.is_empty() {
            return Ok(PeerId::from(s));
        }
    }
    let id = PeerId::generate();
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    std::fs::write(&path, id.as_str()).with_context(|| format!("writing {}", path.display()))?;
    Ok(id)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_persisted() {
        let dir = std::env::temp_dir().join(format!("mesh-node-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let first = load_peer_id(&dir).unwrap();
        let second = load_peer_id(&dir).unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("p-"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
