//! Model pool training.
//!
//! - `Trainer`/`Classifier`: the training capability and its product
//! - `SoftmaxTrainer`: built-in multinomial logistic regression
//! - `TrainingScheduler`: device-bound workers with checkpoint reuse

mod scheduler;
mod softmax;
mod trainer;

pub use scheduler::*;
pub use softmax::*;
pub use trainer::*;
