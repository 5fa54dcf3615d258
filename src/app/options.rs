//! Server application options

use std::path::PathBuf;

use crate::workers::sweeper;

/// Options for running the server
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Chunk staging root; defaults to `<os temp>/fde-chunks`
    pub chunk_root: Option<PathBuf>,

    /// Sweeper worker options
    pub sweeper: sweeper::Options,
}
