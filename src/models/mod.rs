//! Core data models for privaudit.
//!
//! - `config`: run parameters, resolved from TOML
//! - `error`: error taxonomy shared by every stage
//! - `record`: split rows, sample sets, model records and audit results

mod config;
mod error;
mod record;

pub use config::*;
pub use error::*;
pub use record::*;
