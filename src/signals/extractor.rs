//! Signal extraction with an on-disk cache.
//!
//! The signal of sample x under model m is the temperature-scaled softmax
//! probability m assigns to x's true label. Tables are cached under
//! `signals/<key>.json`. The key hashes the model identities, the content of the
//! dataset behind the sample indices, the indices themselves and the temperature.

use super::SignalTable;
use crate::checkpoint::{read_json, write_json_atomic};
use crate::dataset::Dataset;
use crate::models::{AuditConfig, AuditError, ModelRecord, Result, SampleSet};
use crate::train::Classifier;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Computes [`SignalTable`]s for a set of models over a sample set.
#[derive(Debug, Clone)]
pub struct SignalExtractor {
    cache_dir: Option<PathBuf>,
    batch_size: usize,
    temperature: f64,
}

impl SignalExtractor {
    pub fn new(batch_size: usize, temperature: f64) -> Self {
        Self {
            cache_dir: None,
            batch_size: batch_size.max(1),
            temperature,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.batch_size, config.temperature)
    }

    /// Persist and reuse tables under `dir`.
    pub fn with_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Cache key of the signals of `models` on `samples` drawn from `data`.
    pub fn cache_key(
        &self,
        models: &[ModelRecord],
        data: &Dataset,
        samples: &SampleSet,
    ) -> String {
        let mut hasher = Sha256::new();
        for model in models {
            hasher.update(model.identity().as_bytes());
            hasher.update(b";");
        }
        hasher.update(data.digest().as_bytes());
        hasher.update(b";");
        hasher.update(samples.source.to_string().as_bytes());
        hasher.update(b";");
        for i in &samples.indices {
            hasher.update(i.to_le_bytes());
        }
        hasher.update([u8::from(samples.population)]);
        hasher.update(self.temperature.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// Signals of every model in `models` on every sample of `samples`.
    ///
    /// `samples` must index into `data`.
    pub fn compute_signals(
        &self,
        models: &[ModelRecord],
        data: &Dataset,
        samples: &SampleSet,
    ) -> Result<SignalTable> {
        if let Some(&bad) = samples.indices.iter().find(|&&i| i >= data.len()) {
            return Err(AuditError::InvalidInput(format!(
                "sample index {bad} out of range for {} {} rows",
                data.len(),
                samples.source
            )));
        }

        let identities: Vec<String> = models.iter().map(ModelRecord::identity).collect();
        let key = self.cache_key(models, data, samples);
        let cache_path = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{key}.json")));

        if let Some(path) = cache_path.as_ref().filter(|p| p.exists()) {
            let table: SignalTable = read_json(path, "signal cache")?;
            if table.cache_key() == Some(key.as_str())
                && table.model_identities() == identities.as_slice()
                && table.num_samples() == samples.len()
                && table.is_population() == samples.population
            {
                info!(
                    source = %samples.source,
                    models = models.len(),
                    samples = samples.len(),
                    "Signal cache hit"
                );
                return Ok(table);
            }
            warn!(path = %path.display(), "Signal cache does not match request, recomputing");
        }

        let start = Instant::now();
        let values = models
            .par_iter()
            .map(|record| self.model_signals(record.model.as_ref(), data, &samples.indices))
            .collect::<Result<Vec<_>>>()?;
        let mut table = SignalTable::from_probabilities(identities, values, samples.population)?;

        info!(
            source = %samples.source,
            models = models.len(),
            samples = samples.len(),
            secs = format!("{:.2}", start.elapsed().as_secs_f64()),
            "Signals computed"
        );

        if let Some(path) = cache_path {
            table = table.with_cache_key(key);
            write_json_atomic(&path, &table)?;
            debug!(path = %path.display(), "Signal table cached");
        }
        Ok(table)
    }

    fn model_signals(
        &self,
        model: &dyn Classifier,
        data: &Dataset,
        indices: &[usize],
    ) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(indices.len());
        for chunk in indices.chunks(self.batch_size) {
            let batch: Vec<&[f32]> = chunk.iter().map(|&i| data.features(i)).collect();
            let logits = model.logits(&batch);
            if logits.len() != chunk.len() {
                return Err(AuditError::Internal(format!(
                    "model returned {} logit rows for a batch of {}",
                    logits.len(),
                    chunk.len()
                )));
            }
            for (z, &i) in logits.iter().zip(chunk) {
                out.push(true_label_probability(z, data.label(i), self.temperature)?);
            }
        }
        Ok(out)
    }
}

/// `softmax(z / T)[label]`, evaluated in f64 through log-sum-exp.
pub fn true_label_probability(logits: &[f32], label: usize, temperature: f64) -> Result<f64> {
    let Some(&target) = logits.get(label) else {
        return Err(AuditError::InvalidInput(format!(
            "label {label} outside {} logits",
            logits.len()
        )));
    };
    if logits.iter().any(|z| !z.is_finite()) {
        return Err(AuditError::InvalidInput("non-finite logit".into()));
    }

    let scaled = |z: f32| f64::from(z) / temperature;
    let max = logits.iter().map(|&z| scaled(z)).fold(f64::NEG_INFINITY, f64::max);
    let log_sum = max + logits.iter().map(|&z| (scaled(z) - max).exp()).sum::<f64>().ln();
    Ok((scaled(target) - log_sum).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provenance, SampleSource};
    use crate::signals::SIGNAL_EPSILON;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Echoes its configured logits and counts forward passes.
    struct Fixed {
        logits: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for Fixed {
        fn logits(&self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            batch.iter().map(|_| self.logits.clone()).collect()
        }

        fn weights(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!(self.logits))
        }
    }

    fn record(index: usize, logits: Vec<f32>, calls: &Arc<AtomicUsize>) -> ModelRecord {
        ModelRecord {
            index,
            key: format!("split_{index:04}_a"),
            membership: vec![],
            model: Arc::new(Fixed {
                logits,
                calls: Arc::clone(calls),
            }),
            checkpoint_path: PathBuf::new(),
            device: "cpu:0".into(),
            train_acc: 1.0,
            test_acc: 1.0,
            digest: format!("d{index}"),
            provenance: Provenance::Trained,
        }
    }

    fn data() -> Dataset {
        Dataset::new(vec![vec![0.0]; 6], vec![0, 1, 0, 1, 0, 1], Some(2)).unwrap()
    }

    #[test]
    fn test_extreme_logits_stay_inside_open_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let models = vec![record(0, vec![1000.0, -1000.0], &calls)];
        let samples = SampleSet::new(SampleSource::Universe, (0..6).collect(), false);

        let table = SignalExtractor::new(4, 1.0)
            .compute_signals(&models, &data(), &samples)
            .unwrap();
        for i in 0..6 {
            let s = table.get(0, i);
            assert!(s > 0.0 && s < 1.0, "signal {s}");
        }
        assert_eq!(table.get(0, 0), 1.0 - SIGNAL_EPSILON);
        assert_eq!(table.get(0, 1), SIGNAL_EPSILON);
        // 6 samples in batches of 4
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_temperature_flattens_probabilities() {
        let p1 = true_label_probability(&[2.0, 0.0], 0, 1.0).unwrap();
        let p10 = true_label_probability(&[2.0, 0.0], 0, 10.0).unwrap();
        assert!((p1 - 1.0 / (1.0 + (-2.0f64).exp())).abs() < 1e-12);
        assert!(p10 < p1 && p10 > 0.5);
    }

    #[test]
    fn test_label_outside_logits_is_rejected() {
        assert!(true_label_probability(&[0.0, 0.0], 2, 1.0).is_err());
    }

    #[test]
    fn test_warm_cache_skips_forward_passes() {
        let temp_dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let models = vec![
            record(0, vec![1.0, 0.0], &calls),
            record(1, vec![0.0, 3.0], &calls),
        ];
        let samples = SampleSet::new(SampleSource::Universe, vec![5, 0, 3], false);
        let extractor = SignalExtractor::new(256, 1.0).with_cache(temp_dir.path());

        let cold = extractor.compute_signals(&models, &data(), &samples).unwrap();
        let after_cold = calls.load(Ordering::SeqCst);
        assert_eq!(after_cold, 2);

        let warm = extractor.compute_signals(&models, &data(), &samples).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_cold);
        assert_eq!(cold, warm);
        assert_eq!(
            warm.cache_key(),
            Some(extractor.cache_key(&models, &data(), &samples).as_str())
        );
    }

    #[test]
    fn test_changed_rows_miss_the_cache() {
        let temp_dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let models = vec![record(0, vec![1.0, 0.0], &calls)];
        let samples = SampleSet::new(SampleSource::Population, vec![0, 1], true);
        let extractor = SignalExtractor::new(256, 1.0).with_cache(temp_dir.path());

        let original = Dataset::new(vec![vec![0.0]; 2], vec![0, 1], Some(2)).unwrap();
        let relabeled = Dataset::new(vec![vec![0.0]; 2], vec![1, 1], Some(2)).unwrap();

        let first = extractor.compute_signals(&models, &original, &samples).unwrap();
        let second = extractor.compute_signals(&models, &relabeled, &samples).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.get(0, 0), second.get(0, 0));
        assert_eq!(first.get(0, 1), second.get(0, 1));
    }

    #[test]
    fn test_cache_key_tracks_inputs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let models = vec![record(0, vec![0.0, 0.0], &calls)];
        let target = SampleSet::new(SampleSource::Universe, vec![0, 1], false);
        let population = SampleSet::new(SampleSource::Universe, vec![0, 1], true);

        let e1 = SignalExtractor::new(8, 1.0);
        let e2 = SignalExtractor::new(8, 2.0);
        let data = data();
        let base = e1.cache_key(&models, &data, &target);
        assert_ne!(base, e1.cache_key(&models, &data, &population));
        assert_ne!(base, e2.cache_key(&models, &data, &target));

        let mut retrained = models.clone();
        retrained[0].digest = "other".into();
        assert_ne!(base, e1.cache_key(&retrained, &data, &target));

        let moved = Dataset::new(vec![vec![1.0]; 6], vec![0, 1, 0, 1, 0, 1], Some(2)).unwrap();
        assert_ne!(base, e1.cache_key(&models, &moved, &target));
    }
}
