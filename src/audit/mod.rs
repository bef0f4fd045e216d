//! Membership inference audit.
//!
//! - `select`: balanced audit sample and population selection
//! - `engine`: RMIA and LOSS scoring with `offline_a` calibration
//! - `metrics`: ROC, AUC and TPR at low FPR
//! - `range`: neighbourhood score trimming for range audits
//! - `aggregate`: cross-experiment summary and report files

mod aggregate;
mod engine;
mod metrics;
mod range;
mod select;

pub use aggregate::*;
pub use engine::*;
pub use metrics::*;
pub use range::*;
pub use select::*;
