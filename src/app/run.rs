//! Server run loop: build state, start workers, serve until shutdown.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::config::Config;
use crate::errors::FdeError;
use crate::server::chunks::ChunkStore;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::sweeper;

/// Run the fde server until the shutdown signal fires.
pub async fn run(
    version: String,
    config: Config,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FdeError> {
    let config = Arc::new(config);
    let chunk_root = options
        .chunk_root
        .clone()
        .unwrap_or_else(ChunkStore::default_root);
    let chunks = Arc::new(ChunkStore::new(chunk_root));
    let state = Arc::new(ServerState::new(config.clone(), chunks.clone(), version));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sweeper_handle = tokio::spawn(sweeper::run(
        options.sweeper.clone(),
        chunks,
        shutdown_tx.subscribe(),
    ));

    info!(
        environments = config.environments.len(),
        container = config.ctx.container.is_some(),
        "starting fde server"
    );

    let server_handle = serve(&config.server, state, shutdown_signal).await?;
    let result = server_handle
        .await
        .map_err(|e| FdeError::Server(format!("server task failed: {}", e)))?;

    // Server drained; stop the background workers.
    drop(shutdown_tx);
    if let Err(e) = sweeper_handle.await {
        error!("sweeper task failed: {}", e);
    }

    result
}
