//! Records flowing through the audit pipeline.
//!
//! Models and split rows are produced once per run and read-only afterwards;
//! audit results are write-once.

use crate::train::Classifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Role of one sample in one model's split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// Trained on
    In,
    /// Held out of training, used as that model's test data
    Out,
    /// Excluded from every split in the pool
    Unassigned,
}

impl Membership {
    pub fn is_member(self) -> bool {
        self == Self::In
    }
}

/// Collection a sample set indexes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tag", rename_all = "lowercase")]
pub enum SampleSource {
    /// The training universe
    Universe,
    /// The disjoint population pool
    Population,
    /// Neighbourhoods expanded from another set; the tag names the sampler
    Range(String),
}

impl fmt::Display for SampleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Universe => write!(f, "universe"),
            Self::Population => write!(f, "population"),
            Self::Range(tag) => write!(f, "range[{tag}]"),
        }
    }
}

/// Ordered subset of a collection, identified by its source and indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSet {
    pub source: SampleSource,
    pub indices: Vec<usize>,
    /// Drawn as population (never trained on by any pool model)
    pub population: bool,
}

impl SampleSet {
    pub fn new(source: SampleSource, indices: Vec<usize>, population: bool) -> Self {
        Self {
            source,
            indices,
            population,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn is_population(&self) -> bool {
        self.population
    }
}

/// How a model record came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Trained,
    Loaded,
}

/// A trained pool model together with its split row.
#[derive(Clone)]
pub struct ModelRecord {
    /// Position in the pool (row of the split design)
    pub index: usize,
    /// Storage key, derived from the split index
    pub key: String,
    pub membership: Vec<Membership>,
    pub model: Arc<dyn Classifier>,
    pub checkpoint_path: PathBuf,
    pub device: String,
    pub train_acc: f64,
    pub test_acc: f64,
    /// Digest of the serialized weights
    pub digest: String,
    pub provenance: Provenance,
}

impl ModelRecord {
    /// Identity used in signal cache keys; changes whenever the weights do.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.key, self.digest)
    }
}

impl fmt::Debug for ModelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRecord")
            .field("index", &self.index)
            .field("key", &self.key)
            .field("device", &self.device)
            .field("train_acc", &self.train_acc)
            .field("test_acc", &self.test_acc)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

/// ROC-derived attack success metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttackMetrics {
    pub auc: f64,
    /// TPR at FPR below 0.1%
    pub tpr_at_low_fpr: f64,
    /// TPR at FPR of exactly zero
    pub tpr_at_zero_fpr: f64,
}

/// AUC obtained for one calibration grid value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub offline_a: f64,
    pub auc: f64,
}

/// Outcome of the `offline_a` sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Model whose membership labels scored the sweep
    pub proxy: usize,
    pub best_offline_a: f64,
    pub best_auc: f64,
    pub curve: Vec<CalibrationPoint>,
}

/// Audit result for a single target model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAudit {
    pub target: usize,
    /// `offline_a` the final scores were computed with (RMIA only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_a: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
    pub scores: Vec<f64>,
    pub labels: Vec<bool>,
    pub metrics: AttackMetrics,
}

/// Mean, spread and extremes of one metric across experiments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// TPR across experiments at a fixed FPR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub mean_tpr: f64,
    pub std_tpr: f64,
}

/// Metrics averaged over all audited target models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub experiments: usize,
    pub auc: MetricSummary,
    pub tpr_at_low_fpr: MetricSummary,
    pub tpr_at_zero_fpr: MetricSummary,
    pub roc: Vec<RocPoint>,
}
