//! Expired upload task sweeper

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::server::chunks::ChunkStore;

/// Sweeper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Scan interval
    pub interval: Duration,

    /// Tasks idle longer than this are removed
    pub max_age: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Run the sweeper worker until shutdown. Each pass removes upload tasks
/// whose last activity is older than `max_age`; tasks mid-write are skipped
/// because the store re-checks the age under the per-task mutex.
pub async fn run(
    options: Options,
    store: Arc<ChunkStore>,
    mut shutdown_signal: broadcast::Receiver<()>,
) {
    info!(
        interval_secs = options.interval.as_secs(),
        max_age_secs = options.max_age.as_secs(),
        "Sweeper worker starting..."
    );

    loop {
        tokio::select! {
            _ = shutdown_signal.recv() => {
                info!("Sweeper worker shutting down...");
                return;
            }
            _ = tokio::time::sleep(options.interval) => {}
        }

        match store.sweep(options.max_age).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "sweep removed expired upload tasks"),
            Err(e) => error!("sweep failed: {}", e),
        }
    }
}
