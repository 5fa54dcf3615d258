//! Server state shared across handlers

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::server::chunks::ChunkStore;
use crate::server::deploy::DeployManager;

/// Shared state: resolved configuration plus the two stateful subsystems.
pub struct ServerState {
    pub config: Arc<Config>,
    pub chunks: Arc<ChunkStore>,
    pub deploys: Arc<DeployManager>,
    pub started_at: Instant,
    pub version: String,
}

impl ServerState {
    pub fn new(config: Arc<Config>, chunks: Arc<ChunkStore>, version: String) -> Self {
        Self {
            config,
            chunks,
            deploys: Arc::new(DeployManager::new()),
            started_at: Instant::now(),
            version,
        }
    }
}
