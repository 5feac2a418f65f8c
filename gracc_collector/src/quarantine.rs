//! Quarantine (SPEC_FULL.md §4.7, unfinished): a content-addressed store
//! for records that couldn't be published, so a broker outage doesn't lose
//! them outright. Ported from `original_source/quarantine.go`, which this
//! crate also leaves unwired — nothing in `crate::bundle` calls this yet.
//!
//! The original reads the request body in 1024-byte chunks and hashes/
//! writes the whole `buf` on every iteration instead of `buf[..n]`, so a
//! short final read hashes and stores trailing garbage left over from the
//! previous chunk. Fixed here. There's also no chunked reading to get
//! right in the first place: a bundle already lives fully in memory by the
//! time anything would quarantine it, for the same reason the bundle
//! scanner needs no `bufio`-style buffer growing (see `crate::scanner`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error("error preparing quarantine directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Stores payloads under a path derived from their SHA-256, so retrying the
/// same failed bundle doesn't pile up duplicate files.
pub struct Quarantine {
    output_dir: PathBuf,
    bytes: AtomicI64,
}

impl Quarantine {
    pub async fn new(output_dir: impl Into<PathBuf>) -> Result<Self, QuarantineError> {
        let output_dir = output_dir.into();
        if fs::metadata(&output_dir).await.is_err() {
            fs::create_dir_all(&output_dir).await?;
        }
        Ok(Self {
            output_dir,
            bytes: AtomicI64::new(0),
        })
    }

    /// Logs the current quarantine size on a fixed interval. Runs for the
    /// lifetime of the process; there is no shutdown signal, matching the
    /// source's unconditional `for {}` loop.
    pub fn spawn_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                tracing::debug!(
                    bytes = self.bytes.load(Ordering::Relaxed),
                    "quarantine directory size"
                );
            }
        });
    }

    /// Stores `payload`, returning the path it was written to (or already
    /// existed at).
    pub async fn store(&self, payload: &[u8]) -> Result<PathBuf, QuarantineError> {
        let digest = Sha256::digest(payload);
        let hex = hex_encode(&digest);

        let hash_dir = self.output_dir.join(&hex[..2]);
        let new_path = hash_dir.join(&hex[2..]);

        if fs::metadata(&new_path).await.is_ok() {
            return Ok(new_path);
        }

        fs::create_dir_all(&hash_dir).await?;
        fs::write(&new_path, payload).await?;
        self.bytes
            .fetch_add(payload.len() as i64, Ordering::Relaxed);

        Ok(new_path)
    }

    pub fn bytes_stored(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storing_the_same_payload_twice_reuses_the_path() {
        let dir = std::env::temp_dir().join(format!("gracc-quarantine-test-{}", std::process::id()));
        let q = Quarantine::new(&dir).await.unwrap();

        let payload = b"some record bytes";
        let first = q.store(payload).await.unwrap();
        let bytes_after_first = q.bytes_stored();
        let second = q.store(payload).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(q.bytes_stored(), bytes_after_first);
        assert_eq!(tokio::fs::read(&first).await.unwrap(), payload);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn different_payloads_land_in_different_files() {
        let dir = std::env::temp_dir().join(format!("gracc-quarantine-test-b-{}", std::process::id()));
        let q = Quarantine::new(&dir).await.unwrap();

        let a = q.store(b"payload a").await.unwrap();
        let b = q.store(b"payload b").await.unwrap();

        assert_ne!(a, b);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
