//! privaudit - Membership inference privacy auditing for trained model pools.
//!
//! ## Architecture
//!
//! An audit moves through six stages:
//! - **Split design**: paired, complementary training splits over the universe
//! - **Training**: one sequential worker per device, checkpointed per split
//! - **Sample selection**: balanced audit set and a never-trained population
//! - **Signals**: true-label probabilities of every model, cached on disk
//! - **Audit**: RMIA (or LOSS) scores and ROC metrics per target model
//! - **Aggregation**: cross-experiment summary and write-once reports
//!
//! ## Invariants
//!
//! - Paired models are complements over assigned samples
//! - Population samples are never trained on by any pool model
//! - Results are reproducible from the run seed

pub mod audit;
pub mod checkpoint;
pub mod dataset;
pub mod models;
pub mod pipeline;
pub mod signals;
pub mod split;
pub mod train;

// Re-exports for convenience
pub use audit::{AuditEngine, ResultAggregator};
pub use checkpoint::CheckpointStore;
pub use dataset::{Dataset, RangeSampler};
pub use models::{AuditError, Config, Result, TargetAudit};
pub use pipeline::{AuditPipeline, AuditRun};
pub use signals::{SignalExtractor, SignalTable};
pub use split::{SplitDesign, SplitDesigner};
pub use train::{Classifier, SoftmaxTrainer, Trainer, TrainingScheduler};
