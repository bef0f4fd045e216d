//! In-memory classification datasets.
//!
//! A sample's identity is its row position, stable for the lifetime of a run.
//! A dataset's identity is the SHA-256 digest of its labelled rows.

mod range;

pub use range::*;

use crate::models::{AuditError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// One JSONL row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledRow {
    pub features: Vec<f32>,
    pub label: usize,
}

/// Indexable sample collection with integer class labels.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Vec<Vec<f32>>,
    labels: Vec<usize>,
    num_classes: usize,
    digest: String,
}

impl Dataset {
    /// Build a dataset from parallel feature and label vectors.
    ///
    /// `num_classes` defaults to one more than the largest label.
    pub fn new(
        features: Vec<Vec<f32>>,
        labels: Vec<usize>,
        num_classes: Option<usize>,
    ) -> Result<Self> {
        if features.len() != labels.len() {
            return Err(AuditError::InvalidInput(format!(
                "{} feature rows but {} labels",
                features.len(),
                labels.len()
            )));
        }
        if let Some(first) = features.first() {
            let dims = first.len();
            if let Some(row) = features.iter().position(|f| f.len() != dims) {
                return Err(AuditError::InvalidInput(format!(
                    "row {row} has {} features, expected {dims}",
                    features[row].len()
                )));
            }
        }

        let inferred = labels.iter().max().map_or(0, |m| m + 1);
        let num_classes = num_classes.unwrap_or(inferred);
        if inferred > num_classes {
            return Err(AuditError::InvalidInput(format!(
                "label {} out of range for {num_classes} classes",
                inferred - 1
            )));
        }

        let digest = content_digest(&features, &labels, num_classes);
        Ok(Self {
            features,
            labels,
            num_classes,
            digest,
        })
    }

    /// Load a dataset from a JSONL file of `{"features": [...], "label": k}` rows.
    pub fn load_jsonl(path: &Path, num_classes: Option<usize>) -> Result<Self> {
        let file = File::open(path).map_err(|e| AuditError::io("opening dataset file", e))?;
        let reader = BufReader::new(file);
        let mut features = Vec::new();
        let mut labels = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| AuditError::io("reading dataset file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: LabeledRow = serde_json::from_str(&line)
                .map_err(|e| AuditError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            features.push(row.features);
            labels.push(row.label);
        }

        let dataset = Self::new(features, labels, num_classes)?;
        info!(
            path = %path.display(),
            samples = dataset.len(),
            classes = dataset.num_classes(),
            "Loaded dataset"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Feature dimension (0 for an empty dataset).
    pub fn dims(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }

    pub fn features(&self, index: usize) -> &[f32] {
        &self.features[index]
    }

    pub fn label(&self, index: usize) -> usize {
        self.labels[index]
    }

    /// Content digest; equal datasets have equal digests.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

fn content_digest(features: &[Vec<f32>], labels: &[usize], num_classes: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update((num_classes as u64).to_le_bytes());
    hasher.update((labels.len() as u64).to_le_bytes());
    for (row, &label) in features.iter().zip(labels) {
        hasher.update((label as u64).to_le_bytes());
        for x in row {
            hasher.update(x.to_le_bytes());
        }
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_jsonl_skips_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"features": [0.1, 0.2], "label": 0}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"features": [0.3, 0.4], "label": 2}}"#).unwrap();

        let data = Dataset::load_jsonl(file.path(), None).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.num_classes(), 3);
        assert_eq!(data.dims(), 2);
        assert_eq!(data.label(1), 2);
    }

    #[test]
    fn test_load_jsonl_reports_line_number() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"features": [0.1], "label": 0}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = Dataset::load_jsonl(file.path(), None).unwrap_err();
        assert!(err.to_string().contains("Line 2"));
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = Dataset::new(vec![vec![1.0, 2.0], vec![1.0]], vec![0, 1], None).unwrap_err();
        assert!(matches!(err, AuditError::InvalidInput(_)));
    }

    #[test]
    fn test_digest_tracks_rows_and_labels() {
        let base = Dataset::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]], vec![0, 1], None).unwrap();
        let same = Dataset::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]], vec![0, 1], None).unwrap();
        let moved = Dataset::new(vec![vec![1.0, 2.0], vec![3.0, 4.5]], vec![0, 1], None).unwrap();
        let relabeled = Dataset::new(vec![vec![1.0, 2.0], vec![3.0, 4.0]], vec![1, 0], None).unwrap();

        assert_eq!(base.digest(), same.digest());
        assert_ne!(base.digest(), moved.digest());
        assert_ne!(base.digest(), relabeled.digest());
    }

    #[test]
    fn test_new_rejects_label_beyond_class_count() {
        assert!(Dataset::new(vec![vec![1.0]], vec![3], Some(2)).is_err());
    }
}
