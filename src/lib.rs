pub mod access;
pub mod cache;
pub mod cancel;
pub mod cipher;
pub mod clock;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod metadata;
pub mod models;
pub mod query;
pub mod session;
pub mod sql;
pub mod state;
pub mod transaction;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use config::Config;
use error::{Result, WorkbenchError};
use state::Workbench;

/// Serves the HTTP API on `BIND_ADDR` until ctrl-c.
pub async fn run() -> Result<()> {
    let config = Config::from_env()?;
    info!(?config, "starting workbench");
    let bind_addr = config.bind_addr.clone();

    let workbench = Arc::new(Workbench::connect(config)?);
    let reaper = workbench.spawn_reaper();

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| WorkbenchError::Internal(format!("bind {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "listening");

    axum::serve(listener, commands::router(workbench.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .map_err(|e| WorkbenchError::Internal(format!("server error: {e}")))?;

    workbench.shutdown().await?;
    let _ = reaper.await;
    Ok(())
}
