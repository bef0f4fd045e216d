//! Built-in trainer: multinomial logistic regression with mini-batch SGD.

use super::{Classifier, Device, JobProgress, TrainJob, TrainOutcome, Trainer, accuracy};
use crate::dataset::Dataset;
use crate::models::{AuditError, Result, TrainConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Linear classifier `z = W x + b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxModel {
    pub classes: usize,
    pub dims: usize,
    /// Row-major `classes x dims`
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl SoftmaxModel {
    fn zeros(classes: usize, dims: usize) -> Self {
        Self {
            classes,
            dims,
            weights: vec![0.0; classes * dims],
            bias: vec![0.0; classes],
        }
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        (0..self.classes)
            .map(|c| {
                let row = &self.weights[c * self.dims..(c + 1) * self.dims];
                self.bias[c] + row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>()
            })
            .collect()
    }
}

impl Classifier for SoftmaxModel {
    fn logits(&self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
        batch.iter().map(|x| self.forward(x)).collect()
    }

    fn weights(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| AuditError::Internal(format!("Serializing weights: {e}")))
    }
}

/// Trains [`SoftmaxModel`]s. Device names are informational; training runs on CPU.
#[derive(Debug, Clone)]
pub struct SoftmaxTrainer {
    pub epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub weight_decay: f32,
}

impl SoftmaxTrainer {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            epochs: config.epochs,
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            weight_decay: config.weight_decay,
        }
    }

    fn step(&self, model: &mut SoftmaxModel, data: &Dataset, batch: &[usize]) {
        let scale = self.learning_rate / batch.len() as f32;
        let mut grad_w = vec![0.0f32; model.weights.len()];
        let mut grad_b = vec![0.0f32; model.classes];

        for &i in batch {
            let x = data.features(i);
            let probs = softmax(&model.forward(x));
            for (c, p) in probs.iter().enumerate() {
                let g = p - if c == data.label(i) { 1.0 } else { 0.0 };
                grad_b[c] += g;
                for (d, v) in x.iter().enumerate() {
                    grad_w[c * model.dims + d] += g * v;
                }
            }
        }

        for (w, g) in model.weights.iter_mut().zip(&grad_w) {
            *w -= scale * g + self.learning_rate * self.weight_decay * *w;
        }
        for (b, g) in model.bias.iter_mut().zip(&grad_b) {
            *b -= scale * g;
        }
    }
}

impl Trainer for SoftmaxTrainer {
    fn train(
        &self,
        job: &TrainJob,
        data: &Dataset,
        _device: &Device,
        progress: &JobProgress,
    ) -> Result<TrainOutcome> {
        if job.train.is_empty() {
            return Err(AuditError::InvalidInput(format!(
                "job {} has no training samples",
                job.key
            )));
        }

        let mut rng = StdRng::seed_from_u64(job.seed);
        let mut model = SoftmaxModel::zeros(data.num_classes(), data.dims());
        let mut order = job.train.clone();
        let (mut train_acc, mut test_acc) = (0.0, 0.0);

        for epoch in 1..=self.epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(self.batch_size.max(1)) {
                self.step(&mut model, data, batch);
            }

            if model.weights.iter().any(|w| !w.is_finite()) {
                return Err(AuditError::Internal(format!(
                    "weights diverged at epoch {epoch} for job {}",
                    job.key
                )));
            }

            train_acc = accuracy(&model, data, &job.train, 1024);
            test_acc = accuracy(&model, data, &job.test, 1024);
            progress.epoch(epoch, self.epochs, train_acc, test_acc);
        }

        Ok(TrainOutcome {
            model: Arc::new(model),
            train_acc,
            test_acc,
        })
    }

    fn restore(&self, weights: &serde_json::Value) -> Result<Arc<dyn Classifier>> {
        let model: SoftmaxModel = serde_json::from_value(weights.clone())
            .map_err(|e| AuditError::ParseError(format!("Invalid softmax weights: {e}")))?;
        if model.weights.len() != model.classes * model.dims || model.bias.len() != model.classes
        {
            return Err(AuditError::ParseError(
                "softmax weights do not match their shape".into(),
            ));
        }
        Ok(Arc::new(model))
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|z| (z - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
