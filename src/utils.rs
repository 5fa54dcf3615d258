//! Utility functions

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::errors::FdeError;

/// Version information for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Options for exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Calculate the delay before retry number `attempt` (0-based):
/// `min(base * 2^attempt, max) + jitter in [0, jitter)`.
pub fn backoff_delay(options: &BackoffOptions, attempt: u32) -> Duration {
    let exp = options
        .base_delay
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(options.max_delay);
    let capped = exp.min(options.max_delay);
    let jitter_ms = if options.jitter.is_zero() {
        0
    } else {
        rand::thread_rng().gen_range(0..options.jitter.as_millis() as u64)
    };
    capped + Duration::from_millis(jitter_ms)
}

/// SHA-256 of a byte slice, lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a whole file, streamed in 64 KiB reads
pub async fn sha256_file(path: &Path) -> Result<String, FdeError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MD5 of a byte slice, lowercase hex
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

/// Constant-time equality over token bytes.
///
/// Length mismatch still scans the shorter input to keep timing flat for
/// same-length probes; the comparison result never short-circuits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Hex encoding utilities
mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let options = BackoffOptions {
            jitter: Duration::ZERO,
            ..Default::default()
        };

        assert_eq!(backoff_delay(&options, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&options, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&options, 2), Duration::from_secs(4));
        // Capped at max
        assert_eq!(backoff_delay(&options, 10), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_window() {
        let options = BackoffOptions::default();
        for attempt in 0..4 {
            let delay = backoff_delay(&options, attempt);
            let floor = Duration::from_secs(1 << attempt).min(options.max_delay);
            assert!(delay >= floor);
            assert!(delay < floor + Duration::from_millis(500));
        }
    }

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
