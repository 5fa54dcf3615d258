//! Archive orchestration: temp zip lifecycle, directory packing, extraction.
//!
//! Directory uploads go through [`with_temp_archive`], a scoped resource that
//! packs the source tree into `deploy-<env>-<millis>.zip` under the OS temp
//! directory, hands the path to the consumer, and removes the file on every
//! exit path. The zip codec itself comes from the `zip` crate.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::FdeError;

/// Removes the archive file when dropped, covering error and panic exits.
struct TempArchive {
    path: PathBuf,
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Pack `source_dir` into a temporary zip, run `consume` on it, and delete
/// the file afterwards. Exclusions are glob patterns over paths relative to
/// `source_dir`; dotfiles are included by default.
pub async fn with_temp_archive<F, Fut, T>(
    source_dir: &Path,
    env: &str,
    exclude: &[String],
    consume: F,
) -> Result<T, FdeError>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: std::future::Future<Output = Result<T, FdeError>>,
{
    let millis = chrono::Utc::now().timestamp_millis();
    let path = std::env::temp_dir().join(format!("deploy-{}-{}.zip", env, millis));
    let guard = TempArchive { path: path.clone() };

    let patterns = compile_patterns(exclude)?;
    let source = source_dir.to_path_buf();
    let dest = path.clone();
    tokio::task::spawn_blocking(move || pack_zip(&source, &dest, &patterns))
        .await
        .map_err(|e| FdeError::Internal(format!("archive task panicked: {}", e)))??;

    debug!("packed {} into {}", source_dir.display(), path.display());

    let result = consume(path).await;
    drop(guard);
    result
}

fn compile_patterns(exclude: &[String]) -> Result<Vec<glob::Pattern>, FdeError> {
    exclude
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| FdeError::Config(format!("invalid exclude pattern '{}': {}", p, e)))
        })
        .collect()
}

fn is_excluded(rel: &str, patterns: &[glob::Pattern]) -> bool {
    patterns.iter().any(|p| p.matches(rel))
}

/// Build the zip on a blocking thread. Walks the tree depth-first, skipping
/// excluded entries (and whole excluded directories).
fn pack_zip(
    source_dir: &Path,
    dest: &Path,
    patterns: &[glob::Pattern],
) -> Result<(), FdeError> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut stack = vec![source_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = path
                .strip_prefix(source_dir)
                .map_err(|e| FdeError::Archive(format!("path outside source dir: {}", e)))?;
            let rel_str = rel.to_string_lossy().replace('\\', "/");

            if is_excluded(&rel_str, patterns) {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                zip.add_directory(format!("{}/", rel_str), options)
                    .map_err(|e| FdeError::Archive(format!("zip write failed: {}", e)))?;
                stack.push(path);
            } else if file_type.is_file() {
                zip.start_file(rel_str, options)
                    .map_err(|e| FdeError::Archive(format!("zip write failed: {}", e)))?;
                let mut input = std::fs::File::open(&path)?;
                std::io::copy(&mut input, &mut zip)?;
            }
            // Symlinks and special files are not packaged.
        }
    }

    zip.finish()
        .map_err(|e| FdeError::Archive(format!("zip finalize failed: {}", e)))?;
    Ok(())
}

/// Extract a zip archive into `target_dir`, creating parent directories and
/// refusing entries that would escape the target.
pub fn extract_zip(bytes: &[u8], target_dir: &Path) -> Result<(), FdeError> {
    let reader = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| FdeError::Archive(format!("invalid zip archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| FdeError::Archive(format!("failed to read archive: {}", e)))?;

        let Some(relative_path) = file.enclosed_name().as_deref().map(Path::to_path_buf) else {
            return Err(FdeError::Archive(
                "invalid file path in archive".to_string(),
            ));
        };

        let out_path = target_dir.join(relative_path);
        if file.name().ends_with('/') {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut outfile = std::fs::File::create(&out_path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        outfile.write_all(&buffer)?;
    }

    Ok(())
}
