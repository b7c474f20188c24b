//! Checkpoint persistence and retention.
//!
//! Checkpoints live in `<run_dir>/snapshots/<prefix>_epoch_<NNNNNNNN>.<ext>`.
//! The zero-padded epoch makes a lexicographic directory listing match
//! temporal order. The best checkpoint is additionally copied to
//! `<run_dir>/best_snapshot.<ext>`.

use crate::error::SnapshotError;
use crate::monitor::MonitorState;
use crate::persistence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, SnapshotError>;

const FORMAT_VERSION: u32 = 1;

/// Snapshot naming and retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Number of most recent, and of best-per-metric, checkpoints to keep.
    pub num_keep: usize,
    pub prefix: String,
    pub extension: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            num_keep: 10,
            prefix: "snapshot".to_string(),
            extension: "json".to_string(),
        }
    }
}

/// Point-in-time capture of the training state at the end of an epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub model_state: Value,
    pub optimizer_state: Value,
    pub monitor_state: MonitorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_state: Option<Value>,
}

impl Checkpoint {
    fn digest(&self) -> std::result::Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// On-disk envelope around a [`Checkpoint`].
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    format: u32,
    created_at: DateTime<Utc>,
    digest: String,
    checkpoint: Checkpoint,
}

/// Epochs whose checkpoints survive cleanup: the `num_keep` most recent plus,
/// for every metric, its `num_keep` best epochs that still exist on disk.
pub fn retention_set(
    existing: &[usize],
    num_keep: usize,
    best_epochs: &BTreeMap<String, Vec<usize>>,
) -> BTreeSet<usize> {
    let mut sorted: Vec<usize> = existing.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let on_disk: BTreeSet<usize> = sorted.iter().copied().collect();

    let mut keep: BTreeSet<usize> = sorted.iter().rev().take(num_keep).copied().collect();
    for ranking in best_epochs.values() {
        keep.extend(
            ranking
                .iter()
                .filter(|e| on_disk.contains(e))
                .take(num_keep)
                .copied(),
        );
    }
    keep
}

/// Saves, loads, lists and retires checkpoint files of one run.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    run_dir: PathBuf,
    dir: PathBuf,
    config: SnapshotConfig,
    dry_run: bool,
}

impl SnapshotManager {
    pub fn new(run_dir: impl Into<PathBuf>, config: SnapshotConfig, dry_run: bool) -> Self {
        let run_dir = run_dir.into();
        Self {
            dir: run_dir.join("snapshots"),
            run_dir,
            config,
            dry_run,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn num_keep(&self) -> usize {
        self.config.num_keep
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!(
            "{}_epoch_{:08}.{}",
            self.config.prefix, epoch, self.config.extension
        ))
    }

    pub fn best_path(&self) -> PathBuf {
        self.run_dir
            .join(format!("best_snapshot.{}", self.config.extension))
    }

    /// Epoch encoded in a checkpoint file name, if it is one of ours.
    pub fn parse_epoch(&self, file_name: &str) -> Option<usize> {
        let digits = file_name
            .strip_prefix(&self.config.prefix)?
            .strip_prefix("_epoch_")?
            .strip_suffix(&self.config.extension)?
            .strip_suffix('.')?;
        if digits.len() < 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Existing checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|source| SnapshotError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SnapshotError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            if let Some(epoch) = name.to_str().and_then(|n| self.parse_epoch(n)) {
                found.push((epoch, entry.path()));
            }
        }
        found.sort_by_key(|(epoch, _)| *epoch);
        Ok(found)
    }

    pub fn existing_epochs(&self) -> Result<Vec<usize>> {
        Ok(self.list()?.into_iter().map(|(e, _)| e).collect())
    }

    /// Persist `checkpoint`. Returns `None` without touching disk on a dry run.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<Option<PathBuf>> {
        let path = self.path_for(checkpoint.epoch);
        if self.dry_run {
            tracing::debug!(path = %path.display(), "Dry run, not saving checkpoint");
            return Ok(None);
        }
        let digest = checkpoint
            .digest()
            .map_err(|e| SnapshotError::Write {
                path: path.clone(),
                source: std::io::Error::other(e),
            })?;
        let file = CheckpointFile {
            format: FORMAT_VERSION,
            created_at: Utc::now(),
            digest,
            checkpoint: checkpoint.clone(),
        };
        persistence::atomic_write_json(&path, &file).map_err(|source| SnapshotError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(epoch = checkpoint.epoch, path = %path.display(), "Checkpoint saved");
        Ok(Some(path))
    }

    /// Read and verify a checkpoint.
    ///
    /// Unreadable JSON, an unknown format or a digest mismatch are all
    /// reported as [`SnapshotError::Corrupt`].
    pub fn load(&self, path: &Path) -> Result<Checkpoint> {
        let bytes = std::fs::read(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CheckpointFile =
            serde_json::from_slice(&bytes).map_err(|e| SnapshotError::corrupt(path, e))?;
        if file.format != FORMAT_VERSION {
            return Err(SnapshotError::corrupt(
                path,
                format!("unsupported checkpoint format {}", file.format),
            ));
        }
        let digest = file
            .checkpoint
            .digest()
            .map_err(|e| SnapshotError::corrupt(path, e))?;
        if digest != file.digest {
            return Err(SnapshotError::corrupt(path, "digest mismatch"));
        }
        Ok(file.checkpoint)
    }

    pub fn load_epoch(&self, epoch: usize) -> Result<Checkpoint> {
        let path = self.path_for(epoch);
        if !path.exists() {
            return Err(SnapshotError::NotFound {
                epoch,
                dir: self.dir.clone(),
            });
        }
        self.load(&path)
    }

    /// Copy a saved checkpoint over the run's best artifact.
    pub fn promote_best(&self, saved: &Path) -> Result<Option<PathBuf>> {
        let best = self.best_path();
        if self.dry_run {
            return Ok(None);
        }
        persistence::atomic_copy(saved, &best).map_err(|source| SnapshotError::Write {
            path: best.clone(),
            source,
        })?;
        tracing::debug!(from = %saved.display(), to = %best.display(), "Promoted best checkpoint");
        Ok(Some(best))
    }

    /// Delete every checkpoint outside the retention set; returns the removed epochs.
    ///
    /// Idempotent: with unchanged inputs a second call removes nothing. On a
    /// dry run nothing is deleted and the epochs that would go are returned.
    pub fn cleanup(&self, best_epochs: &BTreeMap<String, Vec<usize>>) -> Result<Vec<usize>> {
        let existing = self.list()?;
        let epochs: Vec<usize> = existing.iter().map(|(e, _)| *e).collect();
        let keep = retention_set(&epochs, self.config.num_keep, best_epochs);

        let mut removed = Vec::new();
        for (epoch, path) in existing {
            if keep.contains(&epoch) {
                continue;
            }
            if self.dry_run {
                tracing::debug!(epoch, "Dry run, not removing checkpoint");
                removed.push(epoch);
                continue;
            }
            std::fs::remove_file(&path).map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;
            removed.push(epoch);
        }
        if !removed.is_empty() {
            tracing::info!(
                removed = ?removed,
                kept = keep.len(),
                dry_run = self.dry_run,
                "Cleaned up checkpoints"
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Monitor, MonitorConfig};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn checkpoint(epoch: usize) -> Checkpoint {
        let monitor = Monitor::new(&MonitorConfig::default()).unwrap();
        Checkpoint {
            epoch,
            model_state: serde_json::json!({ "weights": [0.1, 0.2, epoch as f64] }),
            optimizer_state: serde_json::json!({ "lr": 0.01 }),
            monitor_state: monitor.state_dict(),
            scheduler_state: None,
        }
    }

    fn manager(dir: &TempDir, num_keep: usize) -> SnapshotManager {
        SnapshotManager::new(
            dir.path(),
            SnapshotConfig {
                num_keep,
                ..Default::default()
            },
            false,
        )
    }

    #[test]
    fn test_file_naming_sorts_temporally() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        let a = mgr.path_for(9);
        let b = mgr.path_for(10);
        assert!(a.file_name() < b.file_name());
        assert_eq!(
            a.file_name().unwrap().to_str().unwrap(),
            "snapshot_epoch_00000009.json"
        );
    }

    #[test]
    fn test_parse_epoch() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        assert_eq!(mgr.parse_epoch("snapshot_epoch_00000042.json"), Some(42));
        assert_eq!(mgr.parse_epoch("snapshot_epoch_00000042.json.tmp"), None);
        assert_eq!(mgr.parse_epoch("snapshot_epoch_42.json"), None);
        assert_eq!(mgr.parse_epoch("other_epoch_00000042.json"), None);
        assert_eq!(mgr.parse_epoch("best_snapshot.json"), None);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        let ckpt = checkpoint(5);
        let path = mgr.save(&ckpt).unwrap().unwrap();
        assert_eq!(mgr.load(&path).unwrap(), ckpt);
        assert_eq!(mgr.load_epoch(5).unwrap(), ckpt);
        assert_eq!(mgr.existing_epochs().unwrap(), vec![5]);
    }

    #[test]
    fn test_load_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        let path = mgr.save(&checkpoint(1)).unwrap().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("0.01", "0.02")).unwrap();

        let err = mgr.load(&path).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
    }

    #[test]
    fn test_load_truncated_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        let path = mgr.save(&checkpoint(2)).unwrap().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(mgr.load(&path).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_load_missing_epoch() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        assert!(matches!(
            mgr.load_epoch(7),
            Err(SnapshotError::NotFound { epoch: 7, .. })
        ));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mgr = SnapshotManager::new(dir.path(), SnapshotConfig::default(), true);
        assert_eq!(mgr.save(&checkpoint(0)).unwrap(), None);
        assert!(!mgr.dir().exists());
        assert_eq!(mgr.promote_best(&mgr.path_for(0)).unwrap(), None);
        assert!(!mgr.best_path().exists());
    }

    #[test]
    fn test_promote_best_copies() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 3);
        let path = mgr.save(&checkpoint(3)).unwrap().unwrap();
        let best = mgr.promote_best(&path).unwrap().unwrap();
        assert!(path.exists());
        assert_eq!(mgr.load(&best).unwrap().epoch, 3);
    }

    #[test]
    fn test_retention_recent_and_best() {
        let existing = vec![0, 2, 4, 6, 8, 10];
        let mut best = BTreeMap::new();
        best.insert("loss".to_string(), vec![3, 2, 0, 4]);
        best.insert("acc".to_string(), vec![7, 6, 1]);

        let keep = retention_set(&existing, 2, &best);
        // recent: 8, 10; loss best on disk: 2, 0; acc best on disk: 6
        assert_eq!(keep, BTreeSet::from([0, 2, 6, 8, 10]));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 2);
        for epoch in 0..6 {
            mgr.save(&checkpoint(epoch)).unwrap();
        }
        let mut best = BTreeMap::new();
        best.insert("loss".to_string(), vec![1, 0, 5]);

        let removed = mgr.cleanup(&best).unwrap();
        assert_eq!(removed, vec![2, 3]);
        assert_eq!(mgr.existing_epochs().unwrap(), vec![0, 1, 4, 5]);

        assert!(mgr.cleanup(&best).unwrap().is_empty());
        assert_eq!(mgr.existing_epochs().unwrap(), vec![0, 1, 4, 5]);
    }

    #[test]
    fn test_cleanup_dry_run_keeps_files() {
        let dir = TempDir::new().unwrap();
        let writer = manager(&dir, 1);
        for epoch in 0..3 {
            writer.save(&checkpoint(epoch)).unwrap();
        }
        let dry = SnapshotManager::new(
            dir.path(),
            SnapshotConfig {
                num_keep: 1,
                ..Default::default()
            },
            true,
        );
        assert_eq!(dry.cleanup(&BTreeMap::new()).unwrap(), vec![0, 1]);
        assert_eq!(dry.existing_epochs().unwrap(), vec![0, 1, 2]);
    }
}
