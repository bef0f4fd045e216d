//! Per-model, per-sample membership signals.

mod extractor;

pub use extractor::*;

use crate::models::{AuditError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lower and upper clip margin for probabilities: signals lie in `[ε, 1-ε]`.
pub const SIGNAL_EPSILON: f64 = 1e-7;

/// Signals indexed `[model][sample position]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTable {
    /// Identity of the model behind each row
    models: Vec<String>,
    values: Vec<Vec<f64>>,
    population: bool,
    /// Key the table is cached under, if any
    #[serde(default)]
    cache_key: Option<String>,
}

impl SignalTable {
    /// Build from raw probabilities, clipping each into `[ε, 1-ε]`.
    pub fn from_probabilities(
        models: Vec<String>,
        mut values: Vec<Vec<f64>>,
        population: bool,
    ) -> Result<Self> {
        if models.len() != values.len() {
            return Err(AuditError::Internal(format!(
                "{} model identities for {} signal rows",
                models.len(),
                values.len()
            )));
        }
        let width = values.first().map_or(0, Vec::len);
        if values.iter().any(|row| row.len() != width) {
            return Err(AuditError::Internal("ragged signal rows".into()));
        }

        let mut clipped = 0usize;
        for v in values.iter_mut().flatten() {
            let c = v.clamp(SIGNAL_EPSILON, 1.0 - SIGNAL_EPSILON);
            if c != *v {
                clipped += 1;
                *v = c;
            }
        }
        if clipped > 0 {
            warn!(clipped, "Clipped saturated probabilities to epsilon");
        }

        Ok(Self {
            models,
            values,
            population,
            cache_key: None,
        })
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn get(&self, model: usize, sample: usize) -> f64 {
        self.values[model][sample]
    }

    /// All signals of one model.
    pub fn model_row(&self, model: usize) -> &[f64] {
        &self.values[model]
    }

    pub fn model_identities(&self) -> &[String] {
        &self.models
    }

    pub fn num_models(&self) -> usize {
        self.values.len()
    }

    pub fn num_samples(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    pub fn is_population(&self) -> bool {
        self.population
    }
}
