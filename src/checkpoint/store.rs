//! Per-split model checkpoints.
//!
//! - One JSON file per pool model, keyed by split index and side
//! - Written atomically (write-then-rename)
//! - A checkpoint is reusable only if its membership row matches the design
//!   and it was trained on the same universe (by dataset digest)

use super::{digest_json, read_json, write_json_atomic};
use crate::models::{AuditError, Membership, Result};
use crate::split::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Storage key of one pool model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub split: usize,
    pub side: Side,
}

impl CheckpointKey {
    pub fn new(split: usize, side: Side) -> Self {
        Self { split, side }
    }

    /// File stem, e.g. `split_0003_a`.
    pub fn stem(&self) -> String {
        let side = match self.side {
            Side::A => "a",
            Side::B => "b",
            Side::Solo => "solo",
        };
        format!("split_{:04}_{side}", self.split)
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem())
    }
}

/// Persisted state of one trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub key: CheckpointKey,
    pub model_index: usize,
    pub membership: Vec<Membership>,
    /// Digest of the universe the model was trained on
    #[serde(default)]
    pub dataset: String,
    /// Trainer-specific serialized weights
    pub weights: serde_json::Value,
    /// Digest of `weights`
    pub digest: String,
    pub train_acc: f64,
    pub test_acc: f64,
    pub device: String,
    pub trained_at: DateTime<Utc>,
}

impl ModelCheckpoint {
    pub fn new(
        key: CheckpointKey,
        model_index: usize,
        membership: Vec<Membership>,
        weights: serde_json::Value,
        train_acc: f64,
        test_acc: f64,
        device: &str,
    ) -> Result<Self> {
        let digest = digest_json(&weights)?;
        Ok(Self {
            key,
            model_index,
            membership,
            dataset: String::new(),
            weights,
            digest,
            train_acc,
            test_acc,
            device: device.to_string(),
            trained_at: Utc::now(),
        })
    }

    /// Record the digest of the universe the model was trained on.
    pub fn trained_on(mut self, dataset: &str) -> Self {
        self.dataset = dataset.to_string();
        self
    }
}

/// Directory of model checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (or create) a checkpoint directory, removing temp files left by a crash.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| AuditError::io("creating checkpoint dir", e))?;
        let store = Self {
            dir: dir.to_path_buf(),
        };
        store.remove_stale_temps()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: CheckpointKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.stem()))
    }

    pub fn exists(&self, key: CheckpointKey) -> bool {
        self.path(key).exists()
    }

    /// Load the checkpoint for `key`, if one exists.
    pub fn load(&self, key: CheckpointKey) -> Result<Option<ModelCheckpoint>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint: ModelCheckpoint = read_json(&path, "checkpoint")?;
        if checkpoint.key != key {
            return Err(AuditError::ParseError(format!(
                "{} holds checkpoint {}",
                path.display(),
                checkpoint.key
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Load the checkpoint for `key` only if it was trained on `membership`
    /// of the dataset with digest `dataset`.
    pub fn load_matching(
        &self,
        key: CheckpointKey,
        membership: &[Membership],
        dataset: &str,
    ) -> Result<Option<ModelCheckpoint>> {
        match self.load(key)? {
            Some(checkpoint) if checkpoint.membership != membership => {
                warn!(key = %key, "Checkpoint membership differs from split design, retraining");
                Ok(None)
            }
            Some(checkpoint) if checkpoint.dataset != dataset => {
                warn!(key = %key, "Checkpoint was trained on different data, retraining");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Save a checkpoint (atomic write). Returns its path.
    pub fn save(&self, checkpoint: &ModelCheckpoint) -> Result<PathBuf> {
        let path = self.path(checkpoint.key);
        write_json_atomic(&path, checkpoint)?;
        debug!(key = %checkpoint.key, path = %path.display(), "Checkpoint saved");
        Ok(path)
    }

    /// Keys of all checkpoints on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut stems: Vec<String> = self
            .glob("split_*.json")?
            .into_iter()
            .filter(|p| !p.to_string_lossy().ends_with(".tmp.json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        stems.sort();
        Ok(stems)
    }

    fn remove_stale_temps(&self) -> Result<()> {
        for path in self.glob("*.tmp.json")? {
            warn!(path = %path.display(), "Removing incomplete checkpoint write");
            fs::remove_file(&path).map_err(|e| AuditError::io("removing temp checkpoint", e))?;
        }
        Ok(())
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let pattern = self.dir.join(pattern);
        let paths = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| AuditError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(paths)
    }
}
