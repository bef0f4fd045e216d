//! End-to-end audits with stand-in trainers whose behaviour is known exactly.

use privaudit::models::{
    AttackAlgorithm, AuditConfig, Config, DataConfig, RangeConfig, RunConfig, TrainConfig,
};
use privaudit::train::{Device, JobProgress, TrainJob, TrainOutcome};
use privaudit::{AuditPipeline, Classifier, Dataset, Result, Trainer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Confident on its own training samples (identified by feature 0), uniform elsewhere.
struct Memorizer {
    members: HashMap<u32, usize>,
    classes: usize,
}

impl Classifier for Memorizer {
    fn logits(&self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
        batch
            .iter()
            .map(|x| {
                let mut z = vec![0.0; self.classes];
                if let Some(&label) = self.members.get(&(x[0].round() as u32)) {
                    z[label] = 10.0;
                }
                z
            })
            .collect()
    }

    fn weights(&self) -> Result<serde_json::Value> {
        let mut rows: Vec<(u32, usize)> = self.members.iter().map(|(&k, &v)| (k, v)).collect();
        rows.sort_unstable();
        Ok(serde_json::json!({ "classes": self.classes, "members": rows }))
    }
}

struct MemorizingTrainer;

impl Trainer for MemorizingTrainer {
    fn train(
        &self,
        job: &TrainJob,
        data: &Dataset,
        _device: &Device,
        _progress: &JobProgress,
    ) -> Result<TrainOutcome> {
        let members = job
            .train
            .iter()
            .map(|&i| (data.features(i)[0] as u32, data.label(i)))
            .collect();
        Ok(TrainOutcome {
            model: Arc::new(Memorizer {
                members,
                classes: data.num_classes(),
            }),
            train_acc: 1.0,
            test_acc: 1.0 / data.num_classes() as f64,
        })
    }

    fn restore(&self, weights: &serde_json::Value) -> Result<Arc<dyn Classifier>> {
        let classes = weights["classes"].as_u64().unwrap_or(2) as usize;
        let rows: Vec<(u32, usize)> = serde_json::from_value(weights["members"].clone())
            .map_err(|e| privaudit::AuditError::ParseError(e.to_string()))?;
        Ok(Arc::new(Memorizer {
            members: rows.into_iter().collect(),
            classes,
        }))
    }
}

/// Same output for every input.
struct Constant;

impl Classifier for Constant {
    fn logits(&self, batch: &[&[f32]]) -> Vec<Vec<f32>> {
        vec![vec![0.0, 0.0]; batch.len()]
    }

    fn weights(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!(null))
    }
}

struct ConstantTrainer;

impl Trainer for ConstantTrainer {
    fn train(
        &self,
        _job: &TrainJob,
        _data: &Dataset,
        _device: &Device,
        _progress: &JobProgress,
    ) -> Result<TrainOutcome> {
        Ok(TrainOutcome {
            model: Arc::new(Constant),
            train_acc: 0.5,
            test_acc: 0.5,
        })
    }

    fn restore(&self, _weights: &serde_json::Value) -> Result<Arc<dyn Classifier>> {
        Ok(Arc::new(Constant))
    }
}

/// Rows whose first feature is a unique id starting at `first_id`.
fn identified(n: usize, first_id: usize) -> Dataset {
    let features = (0..n)
        .map(|i| vec![(first_id + i) as f32, (i % 3) as f32])
        .collect();
    let labels = (0..n).map(|i| i % 2).collect();
    Dataset::new(features, labels, Some(2)).unwrap()
}

fn config(log_dir: &Path) -> Config {
    Config {
        run: RunConfig {
            random_seed: 42,
            log_dir: log_dir.to_path_buf(),
            num_experiments: 1,
            num_models: Some(4),
            show_progress: false,
        },
        data: DataConfig {
            train_path: log_dir.join("train.jsonl"),
            population_path: None,
            num_classes: Some(2),
            holdout_fraction: 0.0,
        },
        train: TrainConfig {
            devices: vec!["cpu:0".into(), "cpu:1".into()],
            ..TrainConfig::default()
        },
        audit: AuditConfig {
            data_size: Some(20),
            population_size: 20,
            ..AuditConfig::default()
        },
        ramia: RangeConfig::default(),
    }
}

#[tokio::test]
async fn memorizing_models_are_fully_exposed() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline =
        AuditPipeline::with_trainer(config(temp_dir.path()), Arc::new(MemorizingTrainer)).unwrap();

    let run = pipeline
        .run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();

    assert_eq!(run.models_trained, 4);
    assert_eq!(run.audits.len(), 1);
    let audit = &run.audits[0];
    assert_eq!(audit.target, 0);
    assert_eq!(audit.scores.len(), 20);
    assert_eq!(audit.labels.iter().filter(|&&m| m).count(), 10);
    assert_eq!(audit.metrics.auc, 1.0);
    assert_eq!(audit.metrics.tpr_at_zero_fpr, 1.0);
    assert!(run.run_dir.join("exp_0/result.json").exists());
    assert!(run.summary.is_none());
}

#[tokio::test]
async fn memorizing_models_are_exposed_to_loss_attack() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(temp_dir.path());
    config.audit.algorithm = AttackAlgorithm::Loss;
    config.run.num_experiments = 2;
    let pipeline = AuditPipeline::with_trainer(config, Arc::new(MemorizingTrainer)).unwrap();

    let run = pipeline.run_with_data(identified(100, 0), None).await.unwrap();
    assert_eq!(run.audits.len(), 2);
    for audit in &run.audits {
        assert_eq!(audit.metrics.auc, 1.0);
    }
    let summary = run.summary.unwrap();
    assert_eq!(summary.auc.mean, 1.0);
    assert_eq!(summary.auc.std, 0.0);
}

#[tokio::test]
async fn uninformative_models_score_at_chance() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline =
        AuditPipeline::with_trainer(config(temp_dir.path()), Arc::new(ConstantTrainer)).unwrap();

    let run = pipeline
        .run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();

    let audit = &run.audits[0];
    assert!(audit.scores.iter().all(|&s| s == audit.scores[0]));
    assert!((audit.metrics.auc - 0.5).abs() < 1e-12);
}

#[tokio::test]
async fn range_audit_scores_one_value_per_sample() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(temp_dir.path());
    config.ramia = RangeConfig {
        enabled: true,
        sample_size: 4,
        radius: 0.01,
        ..RangeConfig::default()
    };
    let pipeline = AuditPipeline::with_trainer(config, Arc::new(MemorizingTrainer)).unwrap();

    let run = pipeline
        .run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();

    let audit = &run.audits[0];
    assert_eq!(audit.scores.len(), 20);
    // neighbours round back to their centre's id
    assert_eq!(audit.metrics.auc, 1.0);
}

#[tokio::test]
async fn second_run_reuses_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline =
        AuditPipeline::with_trainer(config(temp_dir.path()), Arc::new(MemorizingTrainer)).unwrap();

    let first = pipeline
        .run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();
    let second = pipeline
        .run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();

    assert_eq!(second.models_trained, 0);
    assert_eq!(second.models_loaded, 4);
    assert_eq!(first.audits[0].scores, second.audits[0].scores);
    assert_ne!(first.run_dir, second.run_dir);
}

#[tokio::test]
async fn changed_population_rows_are_not_served_from_cache() {
    let warm_dir = TempDir::new().unwrap();
    let cold_dir = TempDir::new().unwrap();
    let warm =
        AuditPipeline::with_trainer(config(warm_dir.path()), Arc::new(MemorizingTrainer)).unwrap();
    let cold =
        AuditPipeline::with_trainer(config(cold_dir.path()), Arc::new(MemorizingTrainer)).unwrap();

    warm.run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();
    // same shape, but the new rows collide with universe ids
    let rerun = warm
        .run_with_data(identified(100, 0), Some(identified(50, 0)))
        .await
        .unwrap();
    let fresh = cold
        .run_with_data(identified(100, 0), Some(identified(50, 0)))
        .await
        .unwrap();

    assert_eq!(rerun.models_loaded, 4);
    assert_eq!(rerun.audits[0].scores, fresh.audits[0].scores);
}

#[tokio::test]
async fn changed_universe_retrains_the_pool() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline =
        AuditPipeline::with_trainer(config(temp_dir.path()), Arc::new(MemorizingTrainer)).unwrap();

    pipeline
        .run_with_data(identified(100, 0), Some(identified(50, 1000)))
        .await
        .unwrap();
    let shifted = pipeline
        .run_with_data(identified(100, 500), Some(identified(50, 1000)))
        .await
        .unwrap();

    assert_eq!(shifted.models_trained, 4);
    assert_eq!(shifted.models_loaded, 0);
}
