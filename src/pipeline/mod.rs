//! Pipeline module - end-to-end audit orchestration.

mod run;

pub use run::*;
