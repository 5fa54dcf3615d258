//! On-disk chunk staging for resumable uploads.
//!
//! Each upload task owns `<chunkRoot>/<uploadId>/` containing `metadata.json`
//! and `chunk_NNNNNN` files. The metadata file is the canonical state and is
//! written atomically (temp + rename); the uploaded set is recomputed from
//! the chunk files when the metadata file is missing. All mutation runs under
//! a per-task mutex; a global map mutex guards the task-id to mutex mapping.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::FdeError;
use crate::filesys::file::File;
use crate::utils::{md5_hex, sha256_hex};

/// Fixed subfolder of the OS temp dir holding all upload tasks.
pub const CHUNK_DIR_NAME: &str = "fde-chunks";

const METADATA_FILE: &str = "metadata.json";

/// Canonical per-task state, stored as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub upload_id: String,
    pub total_chunks: u32,
    pub file_name: String,
    pub env: String,
    pub should_extract: bool,
    pub uploaded_chunks: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of `init`: the chunks already present and whether the task existed.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub is_resume: bool,
}

/// Result of `status`.
#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub exists: bool,
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: Option<u32>,
}

/// A merged upload ready for handoff to save/extract.
#[derive(Debug)]
pub struct MergedUpload {
    pub meta: UploadMeta,
    pub bytes: Vec<u8>,
    pub checksum_verified: bool,
}

/// Chunk staging store rooted at the chunk root directory.
pub struct ChunkStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Default chunk root: `<os temp>/fde-chunks`.
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join(CHUNK_DIR_NAME)
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Upload ids are opaque but must be path-safe: at most 64 chars from
    /// `[A-Za-z0-9._-]`, and not a directory-traversal name.
    pub fn validate_upload_id(id: &str) -> Result<(), FdeError> {
        if id.is_empty() || id.len() > 64 {
            return Err(FdeError::Validation(
                "uploadId must be 1-64 characters".to_string(),
            ));
        }
        if id == "." || id == ".." {
            return Err(FdeError::Validation("invalid uploadId".to_string()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(FdeError::Validation(
                "uploadId contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }

    fn task_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn meta_file(&self, id: &str) -> File {
        File::new(self.task_dir(id).join(METADATA_FILE))
    }

    async fn task_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn forget_lock(&self, id: &str) {
        self.locks.lock().await.remove(id);
    }

    /// Create the task if absent, otherwise load it for resumption.
    pub async fn init(
        &self,
        id: &str,
        total_chunks: u32,
        file_name: &str,
        env: &str,
        should_extract: bool,
    ) -> Result<InitOutcome, FdeError> {
        Self::validate_upload_id(id)?;
        if total_chunks == 0 {
            return Err(FdeError::Validation(
                "totalChunks must be at least 1".to_string(),
            ));
        }

        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        if let Some(meta) = self.load_meta(id).await? {
            if meta.total_chunks != total_chunks {
                return Err(FdeError::Validation(format!(
                    "upload '{}' was initialised with {} chunks, not {}",
                    id, meta.total_chunks, total_chunks
                )));
            }
            info!(
                upload_id = id,
                uploaded = meta.uploaded_chunks.len(),
                "resuming upload task"
            );
            return Ok(InitOutcome {
                uploaded_chunks: meta.uploaded_chunks.iter().copied().collect(),
                total_chunks,
                is_resume: true,
            });
        }

        let now = Utc::now();
        let meta = UploadMeta {
            upload_id: id.to_string(),
            total_chunks,
            file_name: file_name.to_string(),
            env: env.to_string(),
            should_extract,
            uploaded_chunks: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        };
        tokio::fs::create_dir_all(self.task_dir(id)).await?;
        self.meta_file(id).write_json_atomic(&meta).await?;

        info!(upload_id = id, total_chunks, env, "upload task created");
        Ok(InitOutcome {
            uploaded_chunks: Vec::new(),
            total_chunks,
            is_resume: false,
        })
    }

    /// Write one chunk. Re-writing a present index overwrites the file and
    /// leaves the uploaded set unchanged. An MD5 mismatch fails this chunk
    /// only; the task survives for a retry.
    pub async fn write_chunk(
        &self,
        id: &str,
        index: u32,
        body: &[u8],
        md5: Option<&str>,
    ) -> Result<u32, FdeError> {
        Self::validate_upload_id(id)?;

        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let mut meta = self
            .load_meta(id)
            .await?
            .ok_or_else(|| FdeError::Validation(format!("unknown uploadId '{}'", id)))?;

        if index >= meta.total_chunks {
            return Err(FdeError::Validation(format!(
                "chunk index {} out of range (totalChunks {})",
                index, meta.total_chunks
            )));
        }

        if let Some(expected) = md5 {
            let actual = md5_hex(body);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(FdeError::Integrity(format!(
                    "chunk {} MD5 mismatch: expected {}, got {}",
                    index, expected, actual
                )));
            }
        }

        let chunk_path = self.task_dir(id).join(chunk_file_name(index));
        File::new(chunk_path).write_bytes(body).await?;

        meta.uploaded_chunks.insert(index);
        meta.updated_at = Utc::now();
        self.meta_file(id).write_json_atomic(&meta).await?;

        debug!(upload_id = id, chunk = index, size = body.len(), "chunk written");
        Ok(index)
    }

    /// Read task state without mutating it.
    pub async fn status(&self, id: &str) -> Result<StatusOutcome, FdeError> {
        Self::validate_upload_id(id)?;

        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        match self.load_meta(id).await? {
            Some(meta) => Ok(StatusOutcome {
                exists: true,
                uploaded_chunks: meta.uploaded_chunks.iter().copied().collect(),
                total_chunks: Some(meta.total_chunks),
            }),
            None => {
                // A task dir without metadata still counts as existing; the
                // uploaded set is recomputed from the chunk files.
                if tokio::fs::metadata(self.task_dir(id)).await.is_ok() {
                    let uploaded = self.scan_chunks(id).await?;
                    Ok(StatusOutcome {
                        exists: true,
                        uploaded_chunks: uploaded.iter().copied().collect(),
                        total_chunks: None,
                    })
                } else {
                    Ok(StatusOutcome {
                        exists: false,
                        uploaded_chunks: Vec::new(),
                        total_chunks: None,
                    })
                }
            }
        }
    }

    /// Merge all chunks in ascending index order and verify the whole-file
    /// checksum when provided. A checksum mismatch destroys the task.
    pub async fn complete(
        &self,
        id: &str,
        checksum: Option<&str>,
    ) -> Result<MergedUpload, FdeError> {
        Self::validate_upload_id(id)?;

        let lock = self.task_lock(id).await;
        let _guard = lock.lock().await;

        let meta = self
            .load_meta(id)
            .await?
            .ok_or_else(|| FdeError::Validation(format!("unknown uploadId '{}'", id)))?;

        let missing: Vec<u32> = (0..meta.total_chunks)
            .filter(|i| !meta.uploaded_chunks.contains(i))
            .collect();
        if !missing.is_empty() {
            return Err(FdeError::Upload(format!(
                "incomplete upload: missing chunks {:?}",
                missing
            )));
        }

        let mut bytes = Vec::new();
        for index in 0..meta.total_chunks {
            let chunk_path = self.task_dir(id).join(chunk_file_name(index));
            let chunk = tokio::fs::read(&chunk_path).await.map_err(|e| {
                FdeError::Upload(format!("failed to read chunk {}: {}", index, e))
            })?;
            bytes.extend_from_slice(&chunk);
        }

        let checksum_verified = match checksum {
            Some(expected) => {
                let actual = sha256_hex(&bytes);
                if !expected.eq_ignore_ascii_case(&actual) {
                    drop(_guard);
                    self.remove(id).await?;
                    return Err(FdeError::Integrity(format!(
                        "file checksum mismatch: expected {}, got {}",
                        expected, actual
                    )));
                }
                true
            }
            None => false,
        };

        info!(
            upload_id = id,
            size = bytes.len(),
            chunks = meta.total_chunks,
            checksum_verified,
            "upload merged"
        );
        Ok(MergedUpload {
            meta,
            bytes,
            checksum_verified,
        })
    }

    /// Remove the task directory. Returns whether anything was removed.
    pub async fn remove(&self, id: &str) -> Result<bool, FdeError> {
        Self::validate_upload_id(id)?;

        let lock = self.task_lock(id).await;
        let removed = {
            let _guard = lock.lock().await;
            let dir = self.task_dir(id);
            if tokio::fs::metadata(&dir).await.is_ok() {
                tokio::fs::remove_dir_all(&dir).await?;
                true
            } else {
                false
            }
        };
        self.forget_lock(id).await;
        Ok(removed)
    }

    /// Remove tasks idle for longer than `max_age`. The per-task mutex is
    /// taken before the age is re-checked, so a task in the middle of a
    /// chunk write is never swept.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize, FdeError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| FdeError::Internal(format!("invalid sweep age: {}", e)))?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if Self::validate_upload_id(&id).is_err() {
                continue;
            }

            let lock = self.task_lock(&id).await;
            let expired = {
                let _guard = lock.lock().await;
                let last_touched = match self.load_meta(&id).await {
                    Ok(Some(meta)) => meta.updated_at,
                    // Orphan dir without metadata: fall back to mtime.
                    _ => match entry.metadata().await.and_then(|m| m.modified()) {
                        Ok(mtime) => DateTime::<Utc>::from(mtime),
                        Err(_) => continue,
                    },
                };
                if Utc::now() - last_touched > max_age {
                    tokio::fs::remove_dir_all(entry.path()).await?;
                    true
                } else {
                    false
                }
            };
            if expired {
                self.forget_lock(&id).await;
                warn!(upload_id = %id, "expired upload task removed");
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn load_meta(&self, id: &str) -> Result<Option<UploadMeta>, FdeError> {
        let file = self.meta_file(id);
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_json().await?))
    }

    async fn scan_chunks(&self, id: &str) -> Result<BTreeSet<u32>, FdeError> {
        let mut uploaded = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(self.task_dir(id)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(index) = name.strip_prefix("chunk_") {
                if let Ok(index) = index.parse::<u32>() {
                    uploaded.insert(index);
                }
            }
        }
        Ok(uploaded)
    }
}

fn chunk_file_name(index: u32) -> String {
    format!("chunk_{:06}", index)
}
