//! Daemon lifecycle: open the store, start the actor, recovery loop and
//! socket listener, then wait for a stop signal.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use leasestore::{MemoryStore, SqliteStore, Store};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Backend, Config};
use crate::ipc::{self, ServerContext};
use crate::scanner::RecoveryLoop;
use crate::service::StoreManager;

/// Open the configured backend
pub fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.storage.backend {
        Backend::Sqlite => {
            let path = &config.storage.path;
            let store = SqliteStore::open_with_timeout(path, config.storage.busy_timeout())
                .with_context(|| format!("Failed to open store at {}", path.display()))?;
            info!(path = %path.display(), "Opened SQLite store");
            Ok(Arc::new(store))
        }
        Backend::Memory => {
            warn!("Using in-memory store; entities will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Run the daemon until Ctrl+C, SIGTERM or an IPC `Shutdown`
pub async fn run(config: Config, socket_path: PathBuf) -> Result<()> {
    config.validate()?;
    let store = open_store(&config)?;
    let manager = StoreManager::spawn(store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scanner_handle = if config.scanner.enabled {
        let recovery = RecoveryLoop::new(manager.clone(), config.scanner.interval());
        Some(tokio::spawn(recovery.run(shutdown_rx.clone())))
    } else {
        info!("Recovery loop disabled");
        None
    };

    let (listener, socket_path) = ipc::create_listener_at(&socket_path)?;
    info!(?socket_path, "IPC socket listening");

    let ctx = ServerContext {
        manager: manager.clone(),
        lease: config.lease.clone(),
        shutdown: shutdown_tx.clone(),
    };
    let server_handle = tokio::spawn(ipc::serve(listener, ctx));

    info!("Daemon running. Press Ctrl+C to stop.");
    wait_for_stop(shutdown_rx).await?;

    info!("Daemon shutting down...");
    shutdown_tx.send_replace(true);

    match server_handle.await {
        Ok(Err(e)) => warn!(error = %e, "IPC listener error"),
        Err(e) => warn!(error = %e, "IPC listener task failed"),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = scanner_handle {
        let _ = handle.await;
    }
    if let Err(e) = manager.shutdown().await {
        debug!(error = %e, "run: store manager already stopped");
    }

    ipc::cleanup_socket(&socket_path);
    info!("Daemon stopped");
    Ok(())
}

/// Resolve once the shutdown flag is raised or its sender is gone.
///
/// The `watch::Ref` handed back by `wait_for` is not `Send`; it is dropped
/// here so the futures that select on this stay spawnable.
pub(crate) async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Block until a signal arrives or something else raises the shutdown flag
async fn wait_for_stop(mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
            _ = stop_requested(&mut shutdown_rx) => debug!("wait_for_stop: shutdown flag raised"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                warn!("Ctrl+C received");
            }
            _ = stop_requested(&mut shutdown_rx) => debug!("wait_for_stop: shutdown flag raised"),
        }
    }

    Ok(())
}
