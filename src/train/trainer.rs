//! Training capability consumed by the scheduler.
//!
//! The scheduler knows nothing about architectures or optimizers. A `Trainer`
//! turns one split into a `Classifier` and can rebuild a classifier from the
//! weights stored in its checkpoint.

use crate::checkpoint::CheckpointKey;
use crate::dataset::Dataset;
use crate::models::Result;
use indicatif::ProgressBar;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Forward-only view of a trained model.
pub trait Classifier: Send + Sync {
    /// Raw class logits for each row of the batch.
    fn logits(&self, batch: &[&[f32]]) -> Vec<Vec<f32>>;

    /// Serialized weights, stored in the model's checkpoint.
    fn weights(&self) -> Result<serde_json::Value>;
}

/// Produces classifiers from splits.
pub trait Trainer: Send + Sync {
    /// Train one model on `job.train`, reporting per-epoch progress.
    fn train(
        &self,
        job: &TrainJob,
        data: &Dataset,
        device: &Device,
        progress: &JobProgress,
    ) -> Result<TrainOutcome>;

    /// Rebuild a classifier from checkpointed weights.
    fn restore(&self, weights: &serde_json::Value) -> Result<Arc<dyn Classifier>>;
}

/// A compute device with its own sequential worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub ordinal: usize,
    pub name: String,
}

impl Device {
    pub fn from_names(names: &[String]) -> Vec<Self> {
        names
            .iter()
            .enumerate()
            .map(|(ordinal, name)| Self {
                ordinal,
                name: name.clone(),
            })
            .collect()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One model to train.
#[derive(Debug, Clone)]
pub struct TrainJob {
    pub key: CheckpointKey,
    pub model_index: usize,
    /// Samples to train on
    pub train: Vec<usize>,
    /// Samples held out of training
    pub test: Vec<usize>,
    /// Seed for the trainer's own randomness
    pub seed: u64,
}

/// Result of a successful training job.
pub struct TrainOutcome {
    pub model: Arc<dyn Classifier>,
    pub train_acc: f64,
    pub test_acc: f64,
}

/// Progress sink for one job on one device's bar.
#[derive(Clone)]
pub struct JobProgress {
    bar: ProgressBar,
    device: String,
    job: String,
}

impl JobProgress {
    pub fn new(bar: ProgressBar, device: &Device, key: CheckpointKey) -> Self {
        Self {
            bar,
            device: device.name.clone(),
            job: key.stem(),
        }
    }

    /// Progress that draws nothing.
    pub fn hidden(key: CheckpointKey) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            device: "none".to_string(),
            job: key.stem(),
        }
    }

    /// Report a finished epoch (1-based).
    pub fn epoch(&self, epoch: usize, total: usize, train_acc: f64, test_acc: f64) {
        self.bar.set_length(total as u64);
        self.bar.set_position(epoch as u64);
        self.bar.set_message(format!(
            "{} epoch {epoch}/{total} train-acc {train_acc:.3} test-acc {test_acc:.3}",
            self.job
        ));
        debug!(
            device = %self.device,
            job = %self.job,
            epoch,
            total,
            train_acc,
            test_acc,
            "Epoch complete"
        );
    }
}

/// Fraction of `indices` the classifier labels correctly.
pub fn accuracy(
    model: &dyn Classifier,
    data: &Dataset,
    indices: &[usize],
    batch_size: usize,
) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let mut correct = 0usize;
    for chunk in indices.chunks(batch_size.max(1)) {
        let batch: Vec<&[f32]> = chunk.iter().map(|&i| data.features(i)).collect();
        for (logits, &i) in model.logits(&batch).iter().zip(chunk) {
            if argmax(logits) == Some(data.label(i)) {
                correct += 1;
            }
        }
    }
    correct as f64 / indices.len() as f64
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}
