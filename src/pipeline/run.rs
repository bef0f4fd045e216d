//! End-to-end privacy audit.
//!
//! Pipeline flow:
//! Dataset → Split design → Model pool → Audit/population samples
//!   → Signals → Per-target audits → Report

use crate::audit::{
    AuditEngine, ResultAggregator, check_capacity, reduce_ranges, repeat_membership,
    select_audit_sample, select_population, universe_population_size,
};
use crate::checkpoint::CheckpointStore;
use crate::dataset::{Dataset, RangeSampler};
use crate::models::{
    AggregateReport, AttackAlgorithm, AuditError, Config, Provenance, Result, SampleSet,
    SampleSource, TargetAudit,
};
use crate::signals::SignalExtractor;
use crate::split::SplitDesigner;
use crate::train::{Device, SoftmaxTrainer, Trainer, TrainingScheduler};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of one audit run.
#[derive(Debug)]
pub struct AuditRun {
    pub run_dir: PathBuf,
    pub audits: Vec<TargetAudit>,
    /// Present when more than one target was audited
    pub summary: Option<AggregateReport>,
    pub models_trained: usize,
    pub models_loaded: usize,
    pub runtime_secs: f64,
}

/// Runs the full audit described by a [`Config`].
pub struct AuditPipeline {
    config: Config,
    trainer: Arc<dyn Trainer>,
}

impl AuditPipeline {
    /// Create a pipeline with the built-in softmax trainer.
    pub fn new(config: Config) -> Result<Self> {
        let trainer = Arc::new(SoftmaxTrainer::from_config(&config.train));
        Self::with_trainer(config, trainer)
    }

    /// Create a pipeline with a custom trainer.
    pub fn with_trainer(config: Config, trainer: Arc<dyn Trainer>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, trainer })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load the universe and, when configured, the population pool.
    pub fn load_data(&self) -> Result<(Dataset, Option<Dataset>)> {
        let data = Dataset::load_jsonl(&self.config.data.train_path, self.config.data.num_classes)?;
        let population = self
            .config
            .data
            .population_path
            .as_ref()
            .map(|path| Dataset::load_jsonl(path, Some(data.num_classes())))
            .transpose()?;
        Ok((data, population))
    }

    /// Load data from the configured paths and run.
    pub async fn run(&self) -> Result<AuditRun> {
        let (data, population) = self.load_data()?;
        self.run_with_data(data, population).await
    }

    /// Run the audit on in-memory data.
    pub async fn run_with_data(
        &self,
        data: Dataset,
        population: Option<Dataset>,
    ) -> Result<AuditRun> {
        let start = Instant::now();
        let config = &self.config;
        let seed = config.run.random_seed;

        if let Some(pop) = &population {
            let dims_differ = !pop.is_empty() && pop.dims() != data.dims();
            if pop.num_classes() != data.num_classes() || dims_differ {
                return Err(AuditError::InvalidInput(format!(
                    "population has {} classes and {} features, universe has {} and {}",
                    pop.num_classes(),
                    pop.dims(),
                    data.num_classes(),
                    data.dims()
                )));
            }
        }

        let targets = config.target_indices();
        let design = SplitDesigner::design(
            data.len(),
            config.pool_size(),
            seed,
            config.data.holdout_fraction,
        )?;
        let reserved = match config.audit.algorithm {
            AttackAlgorithm::Rmia => universe_population_size(
                &design,
                population.as_ref().map(Dataset::len),
                config.audit.population_size,
            ),
            AttackAlgorithm::Loss => 0,
        };
        check_capacity(&design, targets[0], config.audit.data_size, reserved)?;
        if targets.len() > 1 {
            warn!(
                experiments = targets.len(),
                "Audit sample is balanced on target model 0 only"
            );
        }

        info!(
            samples = data.len(),
            models = design.num_models(),
            targets = targets.len(),
            algorithm = ?config.audit.algorithm,
            "Starting privacy audit"
        );

        // Training
        let stage = Instant::now();
        let data = Arc::new(data);
        let store = CheckpointStore::open(&config.checkpoint_dir())?;
        let scheduler = TrainingScheduler::new(
            Arc::clone(&self.trainer),
            store,
            Device::from_names(&config.train.devices),
            seed,
        )?
        .with_progress(config.run.show_progress);
        let models = scheduler.train_pool(&design, Arc::clone(&data)).await?;
        let models_loaded = models
            .iter()
            .filter(|m| m.provenance == Provenance::Loaded)
            .count();
        info!(
            trained = models.len() - models_loaded,
            loaded = models_loaded,
            secs = format!("{:.1}", stage.elapsed().as_secs_f64()),
            "Model pool ready"
        );

        // Sample selection
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        let population_set = match config.audit.algorithm {
            AttackAlgorithm::Rmia => select_population(
                &design,
                population.as_ref().map(Dataset::len),
                config.audit.population_size,
                &mut rng,
            )?,
            AttackAlgorithm::Loss => SampleSet::new(SampleSource::Population, Vec::new(), true),
        };
        let audit_set = select_audit_sample(
            &design,
            targets[0],
            config.audit.data_size,
            &population_set,
            &mut rng,
        )?;
        let population_data = match (&population_set.source, &population) {
            (SampleSource::Population, Some(pop)) => pop,
            _ => &*data,
        };

        // Signals
        let stage = Instant::now();
        let extractor = SignalExtractor::from_config(&config.audit).with_cache(config.signal_dir());
        let population_signals =
            extractor.compute_signals(&models, population_data, &population_set)?;
        let membership = design.membership_matrix(&audit_set.indices);
        let engine = AuditEngine::from_design(config.audit.clone(), &design);

        let audits = if config.ramia.enabled {
            let sampler = RangeSampler::from_config(&config.ramia, seed);
            let (range_data, range_set) = sampler.expand(&data, &audit_set)?;
            let signals = extractor.compute_signals(&models, &range_data, &range_set)?;
            info!(
                secs = format!("{:.1}", stage.elapsed().as_secs_f64()),
                ranges = audit_set.len(),
                neighbours = config.ramia.sample_size,
                "Range signals ready"
            );

            let stage = Instant::now();
            let neighbour_membership = repeat_membership(&membership, config.ramia.sample_size);
            let audits = engine
                .audit(&targets, &signals, &population_signals, &neighbour_membership)?
                .into_iter()
                .map(|audit| {
                    let labels = membership[audit.target].clone();
                    reduce_ranges(audit, &config.ramia, labels)
                })
                .collect::<Result<Vec<_>>>()?;
            info!(secs = format!("{:.1}", stage.elapsed().as_secs_f64()), "Range audit complete");
            audits
        } else {
            let signals = extractor.compute_signals(&models, &data, &audit_set)?;
            info!(
                secs = format!("{:.1}", stage.elapsed().as_secs_f64()),
                samples = audit_set.len(),
                population = population_set.len(),
                "Signals ready"
            );

            let stage = Instant::now();
            let audits = engine.audit(&targets, &signals, &population_signals, &membership)?;
            info!(secs = format!("{:.1}", stage.elapsed().as_secs_f64()), "Audit complete");
            audits
        };

        // Report
        let summary = if audits.len() > 1 {
            Some(ResultAggregator::aggregate(&audits)?)
        } else {
            None
        };
        let run_dir =
            ResultAggregator::new(config.report_dir()).write_run(&audits, summary.as_ref())?;

        let runtime_secs = start.elapsed().as_secs_f64();
        info!(
            dir = %run_dir.display(),
            secs = format!("{runtime_secs:.1}"),
            "Privacy audit complete"
        );

        Ok(AuditRun {
            run_dir,
            models_trained: models.len() - models_loaded,
            models_loaded,
            audits,
            summary,
            runtime_secs,
        })
    }
}
