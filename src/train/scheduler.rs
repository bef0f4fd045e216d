//! Training scheduler for the model pool.
//!
//! Concurrency model:
//! - One blocking worker per device, owning that device's job queue
//! - A device runs its jobs strictly one after another
//! - Workers report each job over an mpsc channel; the scheduler holds the
//!   only receiver and counts messages as the completion barrier
//! - A failed job is retried once on the same device; a second failure
//!   aborts the pool

use super::{Device, JobProgress, TrainJob, Trainer};
use crate::checkpoint::{CheckpointKey, CheckpointStore, ModelCheckpoint};
use crate::dataset::Dataset;
use crate::models::{AuditError, Membership, ModelRecord, Provenance, Result};
use crate::split::SplitDesign;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Attempts per job: the first run plus one retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Completion report sent by a device worker.
enum JobMessage {
    Completed(Box<ModelRecord>),
    Failed {
        key: CheckpointKey,
        device: String,
        attempts: u32,
        message: String,
    },
}

/// A job together with the split row its checkpoint records.
struct QueuedJob {
    job: TrainJob,
    membership: Vec<Membership>,
}

/// Trains (or reloads) every model of a split design.
pub struct TrainingScheduler {
    trainer: Arc<dyn Trainer>,
    store: CheckpointStore,
    devices: Vec<Device>,
    seed: u64,
    progress: MultiProgress,
}

impl TrainingScheduler {
    /// Create a scheduler over `devices`.
    pub fn new(
        trainer: Arc<dyn Trainer>,
        store: CheckpointStore,
        devices: Vec<Device>,
        seed: u64,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(AuditError::InvalidInput(
                "scheduler needs at least one device".into(),
            ));
        }
        Ok(Self {
            trainer,
            store,
            devices,
            seed,
            progress: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        })
    }

    /// Draw one progress bar per device.
    pub fn with_progress(mut self, show: bool) -> Self {
        if show {
            self.progress = MultiProgress::new();
        }
        self
    }

    /// Train every model in `design` that has no matching checkpoint, then
    /// return all models in pool order.
    ///
    /// Returns only after every job has resolved.
    pub async fn train_pool(
        &self,
        design: &SplitDesign,
        data: Arc<Dataset>,
    ) -> Result<Vec<ModelRecord>> {
        if data.len() != design.universe_size() {
            return Err(AuditError::InvalidInput(format!(
                "design covers {} samples but dataset has {}",
                design.universe_size(),
                data.len()
            )));
        }

        let mut records: Vec<Option<ModelRecord>> = (0..design.num_models()).map(|_| None).collect();
        let mut pending = Vec::new();

        for slot in design.slots() {
            for (model, side) in slot.models() {
                let key = CheckpointKey::new(slot.split(), side);
                let membership = design.membership(model);
                match self.store.load_matching(key, membership, data.digest())? {
                    Some(checkpoint) => {
                        info!(key = %key, model, "Checkpoint found, skipping training");
                        records[model] = Some(self.restore(checkpoint)?);
                    }
                    None => pending.push(QueuedJob {
                        job: TrainJob {
                            key,
                            model_index: model,
                            train: design.train_indices(model),
                            test: design.test_indices(model),
                            seed: job_seed(self.seed, model),
                        },
                        membership: membership.to_vec(),
                    }),
                }
            }
        }

        info!(
            models = design.num_models(),
            loaded = design.num_models() - pending.len(),
            to_train = pending.len(),
            devices = self.devices.len(),
            "Resolving model pool"
        );

        if !pending.is_empty() {
            for record in self.run_jobs(pending, data).await? {
                let index = record.index;
                records[index] = Some(record);
            }
        }

        records
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.ok_or_else(|| AuditError::Internal(format!("model {i} unresolved"))))
            .collect()
    }

    fn restore(&self, checkpoint: ModelCheckpoint) -> Result<ModelRecord> {
        let model = self.trainer.restore(&checkpoint.weights)?;
        Ok(ModelRecord {
            index: checkpoint.model_index,
            key: checkpoint.key.stem(),
            checkpoint_path: self.store.path(checkpoint.key),
            membership: checkpoint.membership,
            model,
            device: checkpoint.device,
            train_acc: checkpoint.train_acc,
            test_acc: checkpoint.test_acc,
            digest: checkpoint.digest,
            provenance: Provenance::Loaded,
        })
    }

    async fn run_jobs(&self, jobs: Vec<QueuedJob>, data: Arc<Dataset>) -> Result<Vec<ModelRecord>> {
        let expected = jobs.len();
        let mut queues: Vec<Vec<QueuedJob>> = self.devices.iter().map(|_| Vec::new()).collect();
        for (k, job) in jobs.into_iter().enumerate() {
            queues[k % self.devices.len()].push(job);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for (device, queue) in self.devices.iter().cloned().zip(queues) {
            if queue.is_empty() {
                continue;
            }
            let bar = self.progress.add(device_bar(&device, queue.len()));
            let worker = DeviceWorker {
                device,
                trainer: Arc::clone(&self.trainer),
                store: self.store.clone(),
                data: Arc::clone(&data),
                tx: tx.clone(),
                abort: Arc::clone(&abort),
                bar,
            };
            handles.push(tokio::task::spawn_blocking(move || worker.run(queue)));
        }
        drop(tx);

        let mut completed = Vec::with_capacity(expected);
        while completed.len() < expected {
            match rx.recv().await {
                Some(JobMessage::Completed(record)) => completed.push(*record),
                Some(JobMessage::Failed {
                    key,
                    device,
                    attempts,
                    message,
                }) => {
                    abort.store(true, Ordering::SeqCst);
                    return Err(AuditError::TrainingJob {
                        job: key.stem(),
                        device,
                        attempts,
                        message,
                    });
                }
                None => {
                    abort.store(true, Ordering::SeqCst);
                    return Err(AuditError::ChannelClosed);
                }
            }
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| AuditError::Internal(format!("device worker died: {e}")))?;
        }

        Ok(completed)
    }
}

/// Sequential job runner bound to one device.
struct DeviceWorker {
    device: Device,
    trainer: Arc<dyn Trainer>,
    store: CheckpointStore,
    data: Arc<Dataset>,
    tx: mpsc::UnboundedSender<JobMessage>,
    abort: Arc<AtomicBool>,
    bar: ProgressBar,
}

impl DeviceWorker {
    fn run(self, queue: Vec<QueuedJob>) {
        for queued in queue {
            if self.abort.load(Ordering::SeqCst) {
                debug!(device = %self.device, "Pool aborted, skipping remaining jobs");
                break;
            }
            let message = self.execute(&queued);
            let failed = matches!(message, JobMessage::Failed { .. });
            if self.tx.send(message).is_err() || failed {
                break;
            }
            self.bar.inc(1);
        }
        self.bar.finish_and_clear();
    }

    fn execute(&self, queued: &QueuedJob) -> JobMessage {
        let key = queued.job.key;
        let progress = JobProgress::new(self.bar.clone(), &self.device, key);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(queued, &progress) {
                Ok(record) => return JobMessage::Completed(Box::new(record)),
                Err(e) => {
                    warn!(
                        device = %self.device,
                        job = %key,
                        attempt,
                        error = %e,
                        "Training attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        JobMessage::Failed {
            key,
            device: self.device.name.clone(),
            attempts: MAX_ATTEMPTS,
            message: last_error,
        }
    }

    fn attempt(&self, queued: &QueuedJob, progress: &JobProgress) -> Result<ModelRecord> {
        let job = &queued.job;
        let start = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.trainer.train(job, &self.data, &self.device, progress)
        }))
        .map_err(|_| AuditError::Internal(format!("trainer panicked on {}", job.key)))??;

        let checkpoint = ModelCheckpoint::new(
            job.key,
            job.model_index,
            queued.membership.clone(),
            outcome.model.weights()?,
            outcome.train_acc,
            outcome.test_acc,
            &self.device.name,
        )?
        .trained_on(self.data.digest());
        let checkpoint_path: PathBuf = self.store.save(&checkpoint)?;

        info!(
            device = %self.device,
            job = %job.key,
            train_acc = format!("{:.3}", outcome.train_acc),
            test_acc = format!("{:.3}", outcome.test_acc),
            secs = format!("{:.1}", start.elapsed().as_secs_f64()),
            "Model trained"
        );

        Ok(ModelRecord {
            index: job.model_index,
            key: job.key.stem(),
            membership: checkpoint.membership,
            model: outcome.model,
            checkpoint_path,
            device: self.device.name.clone(),
            train_acc: outcome.train_acc,
            test_acc: outcome.test_acc,
            digest: checkpoint.digest,
            provenance: Provenance::Trained,
        })
    }
}

fn device_bar(device: &Device, jobs: usize) -> ProgressBar {
    let bar = ProgressBar::new(jobs as u64);
    let style = ProgressStyle::with_template("{prefix:>8} [{elapsed_precise}] {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_prefix(device.name.clone());
    bar
}

/// Per-model seed derived from the run seed.
fn job_seed(seed: u64, model: usize) -> u64 {
    seed ^ (model as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
