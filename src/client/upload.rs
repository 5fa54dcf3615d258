//! Chunked upload client.
//!
//! The upload id is the first 32 hex chars of the whole-file SHA-256, so
//! identical bytes resume automatically: init returns the chunks already
//! staged and only the remainder is sent. A fixed worker pool drains a FIFO
//! queue of missing indices; each chunk carries its MD5 and retries with
//! jittered exponential backoff. A chunk that exhausts its retries aborts
//! the upload without cancelling the server-side task, so the next run
//! resumes.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::http::{ApiClient, CompleteRequestBody, InitRequestBody, UploadOutcome};
use crate::client::progress::Progress;
use crate::errors::FdeError;
use crate::utils::{backoff_delay, md5_hex, sha256_file, BackoffOptions};

/// Upload tunables. The defaults follow the wire contract: 1 MiB chunks,
/// three workers, three retries per chunk.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub workers: usize,
    pub retries: u32,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            workers: 3,
            retries: 3,
        }
    }
}

/// Content-derived upload identity: the first 32 hex chars of the file's
/// SHA-256.
pub fn derive_upload_id(checksum: &str) -> String {
    checksum.chars().take(32).collect()
}

/// Upload one file. Files at or under a single chunk go through the
/// single-shot multipart endpoint; everything else uses the chunked flow.
pub async fn upload_file(
    client: &ApiClient,
    env: &str,
    path: &Path,
    should_extract: bool,
    options: &UploadOptions,
    progress: &Progress,
) -> Result<UploadOutcome, FdeError> {
    let metadata = tokio::fs::metadata(path).await?;
    let file_size = metadata.len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| FdeError::Upload(format!("not a file: {}", path.display())))?;

    let checksum = sha256_file(path).await?;

    if file_size < options.chunk_size as u64 {
        let bytes = tokio::fs::read(path).await?;
        let outcome = client
            .upload_small(env, &file_name, bytes, Some(&checksum), should_extract)
            .await?;
        progress.finish("uploaded");
        return Ok(outcome);
    }

    let upload_id = derive_upload_id(&checksum);
    let total_chunks = file_size.div_ceil(options.chunk_size as u64).max(1) as u32;

    let init = client
        .upload_init(&InitRequestBody {
            upload_id: upload_id.clone(),
            total_chunks,
            file_name: file_name.clone(),
            checksum: Some(checksum.clone()),
            should_extract,
            env: env.to_string(),
        })
        .await?;

    let uploaded: HashSet<u32> = init.uploaded_chunks.into_iter().collect();
    if init.is_resume {
        info!(
            upload_id = %upload_id,
            present = uploaded.len(),
            total = total_chunks,
            "resuming earlier upload"
        );
    }

    let pending: VecDeque<u32> = (0..total_chunks)
        .filter(|i| !uploaded.contains(i))
        .collect();
    let done = Arc::new(AtomicUsize::new(uploaded.len()));
    progress.update(done.load(Ordering::Relaxed), total_chunks as usize);

    let queue = Arc::new(Mutex::new(pending));
    let backoff = BackoffOptions::default();
    let worker_count = options.workers.max(1);

    let workers = (0..worker_count).map(|_| {
        upload_worker(
            client,
            env,
            path,
            &upload_id,
            options,
            file_size,
            queue.clone(),
            done.clone(),
            total_chunks as usize,
            &backoff,
            progress,
        )
    });
    futures::future::try_join_all(workers).await?;

    let outcome = client
        .upload_complete(&CompleteRequestBody {
            upload_id,
            file_name,
            checksum: Some(checksum),
            should_extract,
            env: env.to_string(),
        })
        .await?;
    progress.finish("uploaded");
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn upload_worker(
    client: &ApiClient,
    env: &str,
    path: &Path,
    upload_id: &str,
    options: &UploadOptions,
    file_size: u64,
    queue: Arc<Mutex<VecDeque<u32>>>,
    done: Arc<AtomicUsize>,
    total: usize,
    backoff: &BackoffOptions,
    progress: &Progress,
) -> Result<(), FdeError> {
    loop {
        let index = { queue.lock().await.pop_front() };
        let Some(index) = index else {
            return Ok(());
        };

        let body = read_chunk(path, index, options.chunk_size, file_size).await?;
        let digest = md5_hex(&body);

        let mut attempt: u32 = 0;
        loop {
            match client
                .upload_chunk(upload_id, index, env, body.clone(), &digest)
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < options.retries => {
                    let delay = backoff_delay(backoff, attempt);
                    warn!(
                        chunk = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "chunk upload failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(FdeError::Upload(format!(
                        "chunk {} failed after {} retries: {}",
                        index, options.retries, e
                    )));
                }
            }
        }

        let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
        progress.update(finished, total);
    }
}

/// Read the slice for one chunk: offset `index * chunk_size`, length at most
/// `chunk_size` (the final chunk may be shorter).
async fn read_chunk(
    path: &Path,
    index: u32,
    chunk_size: usize,
    file_size: u64,
) -> Result<Vec<u8>, FdeError> {
    let offset = index as u64 * chunk_size as u64;
    let len = (file_size.saturating_sub(offset)).min(chunk_size as u64) as usize;

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
