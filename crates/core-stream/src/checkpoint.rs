//! Durable stream checkpoints.
//!
//! A checkpoint is a small JSON record naming the program, the completed-line
//! cursor, and run metrics, sealed with an 8-hex-character checksum computed
//! over the fields in canonical order. Files are named
//! `cp_<monotonic>_<rand6>.json`; retention keeps the newest N by the
//! monotonic counter in the name.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

static CHECKPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },
    #[error("checkpoint is for program {stored}, not {requested}")]
    ProgramMismatch { stored: String, requested: String },
    #[error("no checkpoint found")]
    NotFound,
}

/// Aggregate counters captured with the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkMetrics {
    pub lines_sent: u64,
    pub lines_ok: u64,
    pub lines_errored: u64,
    pub bytes_sent: u64,
}

/// One durable record. `cursor` counts completed sendable lines; a resumed
/// stream starts at exactly `cursor` (0-based index), line `cursor + 1` in
/// human terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    /// Seconds since the Unix epoch at creation.
    pub timestamp: u64,
    pub program_path: String,
    pub cursor: usize,
    pub metrics: ChunkMetrics,
    pub checksum: String,
}

impl Checkpoint {
    pub fn new(id: u64, program_path: &str, cursor: usize, metrics: ChunkMetrics) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let checksum = compute_checksum(id, timestamp, program_path, cursor, &metrics);
        Self {
            id,
            timestamp,
            program_path: program_path.to_string(),
            cursor,
            metrics,
            checksum,
        }
    }

    /// Recompute and compare the checksum.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        let computed = compute_checksum(
            self.id,
            self.timestamp,
            &self.program_path,
            self.cursor,
            &self.metrics,
        );
        if computed != self.checksum {
            return Err(CheckpointError::ChecksumMismatch {
                stored: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }
}

/// FNV-1a over the canonical field order, rendered as 8 hex chars.
fn compute_checksum(
    id: u64,
    timestamp: u64,
    program_path: &str,
    cursor: usize,
    metrics: &ChunkMetrics,
) -> String {
    let canonical = format!(
        "{id}|{timestamp}|{program_path}|{cursor}|{}|{}|{}|{}",
        metrics.lines_sent, metrics.lines_ok, metrics.lines_errored, metrics.bytes_sent
    );
    let mut hash: u32 = 0x811c_9dc5;
    for byte in canonical.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{hash:08x}")
}

/// Directory of checkpoint files with count-based retention.
pub struct CheckpointStore {
    dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            dir: dir.into(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    /// Persist a new checkpoint and prune beyond the retention count.
    /// Returns the written path.
    pub async fn save(
        &self,
        program_path: &str,
        cursor: usize,
        metrics: ChunkMetrics,
    ) -> Result<(PathBuf, Checkpoint), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let id = next_monotonic_id();
        let checkpoint = Checkpoint::new(id, program_path, cursor, metrics);
        let file_name = format!("cp_{id}_{}.json", rand6());
        let path = self.dir.join(file_name);
        let json = serde_json::to_string_pretty(&checkpoint)?;
        tokio::fs::write(&path, json).await?;
        info!(
            target: "stream.checkpoint",
            path = %path.display(),
            cursor,
            "checkpoint_written"
        );
        self.prune().await?;
        Ok((path, checkpoint))
    }

    /// Load and validate the newest checkpoint for `program_path`.
    pub async fn latest_for(&self, program_path: &str) -> Result<Checkpoint, CheckpointError> {
        let mut newest: Option<(u64, PathBuf)> = None;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Err(CheckpointError::NotFound),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = parse_checkpoint_id(&name) else {
                continue;
            };
            // Skip files recorded for other programs without failing the scan.
            let Ok(content) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&content) else {
                warn!(target: "stream.checkpoint", file = %name, "unreadable_checkpoint_skipped");
                continue;
            };
            if checkpoint.program_path != program_path {
                continue;
            }
            if newest.as_ref().is_none_or(|(max_id, _)| id > *max_id) {
                newest = Some((id, entry.path()));
            }
        }
        let (_, path) = newest.ok_or(CheckpointError::NotFound)?;
        let content = tokio::fs::read_to_string(&path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        checkpoint.validate()?;
        if checkpoint.program_path != program_path {
            return Err(CheckpointError::ProgramMismatch {
                stored: checkpoint.program_path,
                requested: program_path.to_string(),
            });
        }
        debug!(
            target: "stream.checkpoint",
            path = %path.display(),
            cursor = checkpoint.cursor,
            "checkpoint_loaded"
        );
        Ok(checkpoint)
    }

    /// Delete oldest files beyond the retention count.
    async fn prune(&self) -> Result<(), CheckpointError> {
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = parse_checkpoint_id(&name) {
                found.push((id, entry.path()));
            }
        }
        if found.len() <= self.max_checkpoints {
            return Ok(());
        }
        found.sort_by_key(|(id, _)| *id);
        let excess = found.len() - self.max_checkpoints;
        for (_, path) in found.into_iter().take(excess) {
            debug!(target: "stream.checkpoint", path = %path.display(), "checkpoint_pruned");
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }
}

fn next_monotonic_id() -> u64 {
    // Wall-clock seed keeps ids monotonic across process restarts; the
    // in-process counter breaks ties within one second.
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let seq = CHECKPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    wall * 1000 + (seq % 1000)
}

fn rand6() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let mixed = nanos
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(CHECKPOINT_SEQ.load(Ordering::Relaxed));
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..6)
        .map(|i| ALPHABET[((mixed >> (i * 6)) % ALPHABET.len() as u64) as usize] as char)
        .collect()
}

fn parse_checkpoint_id(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix("cp_")?.strip_suffix(".json")?;
    let (id, _) = rest.split_once('_')?;
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_eight_hex_chars_and_stable() {
        let a = Checkpoint::new(1, "job.nc", 100, ChunkMetrics::default());
        assert_eq!(a.checksum.len(), 8);
        assert!(a.checksum.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.validate().is_ok());
    }

    #[test]
    fn tampered_cursor_fails_validation() {
        let mut checkpoint = Checkpoint::new(1, "job.nc", 100, ChunkMetrics::default());
        checkpoint.cursor = 200;
        assert!(matches!(
            checkpoint.validate(),
            Err(CheckpointError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn checksum_depends_on_every_field() {
        let base = compute_checksum(1, 2, "a.nc", 3, &ChunkMetrics::default());
        assert_ne!(base, compute_checksum(9, 2, "a.nc", 3, &ChunkMetrics::default()));
        assert_ne!(base, compute_checksum(1, 9, "a.nc", 3, &ChunkMetrics::default()));
        assert_ne!(base, compute_checksum(1, 2, "b.nc", 3, &ChunkMetrics::default()));
        assert_ne!(base, compute_checksum(1, 2, "a.nc", 9, &ChunkMetrics::default()));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 5);

        let metrics = ChunkMetrics {
            lines_sent: 1000,
            lines_ok: 1000,
            lines_errored: 0,
            bytes_sent: 12_345,
        };
        let (path, written) = store.save("job.nc", 1000, metrics).await.unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cp_"));
        assert!(name.ends_with(".json"));

        let loaded = store.latest_for("job.nc").await.unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.cursor, 1000);
        assert_eq!(loaded.metrics, metrics);
    }

    #[tokio::test]
    async fn latest_picks_highest_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);

        for cursor in [100, 200, 300] {
            store.save("job.nc", cursor, ChunkMetrics::default()).await.unwrap();
        }
        let latest = store.latest_for("job.nc").await.unwrap();
        assert_eq!(latest.cursor, 300);
    }

    #[tokio::test]
    async fn retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 2);

        for cursor in [1, 2, 3, 4] {
            store.save("job.nc", cursor, ChunkMetrics::default()).await.unwrap();
        }
        let mut remaining = 0;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if parse_checkpoint_id(&entry.file_name().to_string_lossy()).is_some() {
                remaining += 1;
            }
        }
        assert_eq!(remaining, 2);
        // The newest survives pruning.
        assert_eq!(store.latest_for("job.nc").await.unwrap().cursor, 4);
    }

    #[tokio::test]
    async fn corrupted_file_fails_checksum_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 5);
        let (path, _) = store.save("job.nc", 50, ChunkMetrics::default()).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let tampered = content.replace("\"cursor\": 50", "\"cursor\": 5000");
        tokio::fs::write(&path, tampered).await.unwrap();

        assert!(matches!(
            store.latest_for("job.nc").await,
            Err(CheckpointError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn missing_directory_reports_not_found() {
        let store = CheckpointStore::new("/nonexistent/checkpoints", 5);
        assert!(matches!(
            store.latest_for("job.nc").await,
            Err(CheckpointError::NotFound)
        ));
    }

    #[tokio::test]
    async fn other_programs_checkpoints_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 5);
        store.save("other.nc", 999, ChunkMetrics::default()).await.unwrap();
        assert!(matches!(
            store.latest_for("job.nc").await,
            Err(CheckpointError::NotFound)
        ));
    }
}
