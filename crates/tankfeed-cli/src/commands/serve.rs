//! Serve command implementation.

use crate::server::{self, ServerState};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tankfeed_core::engine::IngestionEngine;
use tankfeed_core::Config;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Run the engine and its servers until a signal arrives. Returns true when
/// stopped by Ctrl+C.
pub async fn run(config: Config) -> Result<bool> {
    info!(
        sources = config.sources.len(),
        port = config.server.port,
        path = %config.server.path,
        "Starting tankfeed"
    );

    let engine = Arc::new(IngestionEngine::new(config)?);
    let shutdown_tx = engine.shutdown_signal();

    let state = Arc::new(ServerState {
        engine: Arc::clone(&engine),
    });
    let listeners = server::bind_all(&state).await?;

    let server_shutdown_rx = shutdown_tx.subscribe();
    let servers = tokio::spawn(async move {
        server::report(server::serve(state, listeners, server_shutdown_rx).await)
    });

    // Spawn a task to handle shutdown signals (SIGINT and SIGTERM)
    let interrupted = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown_tx.clone();
    let interrupted_flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if wait_for_signal().await {
            interrupted_flag.store(true, Ordering::SeqCst);
        }
        let _ = shutdown_signal.send(());
    });

    engine.run().await?;

    if let Err(e) = servers.await {
        warn!(error = %e, "Server task ended abnormally");
    }

    info!("tankfeed stopped");
    Ok(interrupted.load(Ordering::SeqCst))
}

/// Wait for SIGINT or SIGTERM. Returns true for SIGINT.
async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                        true
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler, listening for Ctrl+C only");
                ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            true
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<bool>().await
        }
    }
}
