//! Configuration models for privaudit.
//!
//! Every run parameter is explicit here and resolved from a TOML file.
//! `Config::validate` rejects inconsistent runs before any model is trained.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Top-level configuration for privaudit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Run-wide settings (seed, output directory, experiment count)
    pub run: RunConfig,

    /// Dataset locations
    pub data: DataConfig,

    /// Model pool training
    #[serde(default)]
    pub train: TrainConfig,

    /// Attack and calibration settings
    #[serde(default)]
    pub audit: AuditConfig,

    /// Range membership inference (optional)
    #[serde(default)]
    pub ramia: RangeConfig,
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Seed for split design, sample selection and training
    #[serde(default = "default_seed")]
    pub random_seed: u64,

    /// Root directory for checkpoints, signal caches and reports
    pub log_dir: PathBuf,

    /// Number of target models to audit (models 0..num_experiments)
    #[serde(default = "default_num_experiments")]
    pub num_experiments: usize,

    /// Explicit pool size; derived from experiments and references when absent
    #[serde(default)]
    pub num_models: Option<usize>,

    /// Draw per-device progress bars
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_seed() -> u64 {
    1234
}

fn default_num_experiments() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Dataset locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSONL file with the sample universe
    pub train_path: PathBuf,

    /// JSONL file with a disjoint population pool
    #[serde(default)]
    pub population_path: Option<PathBuf>,

    /// Number of classes; inferred from labels when absent
    #[serde(default)]
    pub num_classes: Option<usize>,

    /// Fraction of the universe never assigned to any model's split
    #[serde(default)]
    pub holdout_fraction: f64,
}

/// Model pool training settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Compute devices; one sequential worker per entry
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,

    /// Epochs per model
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Learning rate for the built-in trainer
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Mini-batch size for the built-in trainer
    #[serde(default = "default_train_batch_size")]
    pub batch_size: usize,

    /// L2 penalty for the built-in trainer
    #[serde(default)]
    pub weight_decay: f32,
}

fn default_devices() -> Vec<String> {
    vec!["cpu:0".to_string()]
}

fn default_epochs() -> usize {
    20
}

fn default_learning_rate() -> f32 {
    0.1
}

fn default_train_batch_size() -> usize {
    64
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            batch_size: default_train_batch_size(),
            weight_decay: 0.0,
        }
    }
}

/// Membership score computed per audited sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttackAlgorithm {
    /// Calibrated likelihood ratio against a population (default)
    #[default]
    Rmia,
    /// Raw target-model confidence, no references
    Loss,
}

/// Order in which candidate reference models are considered.
///
/// Decides which paired model serves as the out-reference when several qualify.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceOrder {
    /// Ascending model index (default)
    #[default]
    Index,
    /// Closest model index to the target first, lower index on ties
    Nearest,
}

/// Attack and calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub algorithm: AttackAlgorithm,

    /// Out-references used per sample
    #[serde(default = "default_num_ref_models")]
    pub num_ref_models: usize,

    /// Balanced audit-set size; the whole universe when absent
    #[serde(default)]
    pub data_size: Option<usize>,

    /// Cap on the population subset
    #[serde(default = "default_population_size")]
    pub population_size: usize,

    /// Likelihood-ratio threshold against each population sample
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Calibration grid for `offline_a`
    #[serde(default = "default_offline_a_grid")]
    pub offline_a_grid: Vec<f64>,

    /// Fixed `offline_a`; skips the calibration sweep
    #[serde(default)]
    pub offline_a: Option<f64>,

    #[serde(default)]
    pub reference_order: ReferenceOrder,

    /// Forward-pass batch size for signal extraction
    #[serde(default = "default_signal_batch_size")]
    pub batch_size: usize,

    /// Softmax temperature applied to logits
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_num_ref_models() -> usize {
    1
}

fn default_population_size() -> usize {
    10_000
}

fn default_gamma() -> f64 {
    1.0
}

/// 0.0, 0.1, ..., 1.0
pub fn default_offline_a_grid() -> Vec<f64> {
    (0..=10).map(|i| i as f64 / 10.0).collect()
}

fn default_signal_batch_size() -> usize {
    256
}

fn default_temperature() -> f64 {
    1.0
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            algorithm: AttackAlgorithm::default(),
            num_ref_models: default_num_ref_models(),
            data_size: None,
            population_size: default_population_size(),
            gamma: default_gamma(),
            offline_a_grid: default_offline_a_grid(),
            offline_a: None,
            reference_order: ReferenceOrder::default(),
            batch_size: default_signal_batch_size(),
            temperature: default_temperature(),
        }
    }
}

/// Neighbourhood drawn around each audited sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RangeFunction {
    /// Isotropic Gaussian noise with standard deviation `radius`
    #[default]
    Gaussian,
    /// Uniform noise in an L-infinity box of half-width `radius`
    UniformBox,
}

/// Which end of a range's scores is discarded before averaging.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrimDirection {
    /// Drop the lowest scores (default)
    #[default]
    Bottom,
    /// Drop the highest scores
    Top,
}

/// Range membership inference settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Neighbours drawn per audited sample
    #[serde(default = "default_range_sample_size")]
    pub sample_size: usize,

    #[serde(default)]
    pub range_function: RangeFunction,

    #[serde(default = "default_radius")]
    pub radius: f32,

    /// Fraction of each range's scores dropped before averaging
    #[serde(default = "default_trim_ratio")]
    pub trim_ratio: f64,

    #[serde(default)]
    pub trim_direction: TrimDirection,
}

fn default_range_sample_size() -> usize {
    10
}

fn default_radius() -> f32 {
    0.05
}

fn default_trim_ratio() -> f64 {
    0.2
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_size: default_range_sample_size(),
            range_function: RangeFunction::default(),
            radius: default_radius(),
            trim_ratio: default_trim_ratio(),
            trim_direction: TrimDirection::default(),
        }
    }
}

/// Annotated configuration printed by `privaudit example`.
pub const EXAMPLE_CONFIG: &str = r#"# privaudit configuration file

[run]
random_seed = 1234
log_dir = "runs/demo"          # supports ${VAR} expansion
num_experiments = 2            # models 0 and 1 are audited as targets
# num_models = 6               # defaults to 2 * max(ceil(experiments / 2), num_ref_models + 1)
show_progress = true

[data]
train_path = "data/train.jsonl"            # {"features": [...], "label": 0} per line
population_path = "data/population.jsonl"  # disjoint from the training universe
holdout_fraction = 0.0

[train]
devices = ["cpu:0", "cpu:1"]
epochs = 20
learning_rate = 0.1
batch_size = 64

[audit]
algorithm = "rmia"             # or "loss"
num_ref_models = 2
data_size = 500                # balanced members / non-members
population_size = 1000
gamma = 1.0
reference_order = "index"      # or "nearest"
# offline_a = 0.3              # fix instead of sweeping offline_a_grid
batch_size = 256
temperature = 1.0

[ramia]
enabled = false
sample_size = 10
range_function = "gaussian"    # or "uniform_box"
radius = 0.05
trim_ratio = 0.2
trim_direction = "bottom"
"#;

impl Config {
    /// Load configuration from a TOML file and expand `${VAR}` in paths.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.expand_paths();
        Ok(config)
    }

    fn expand_paths(&mut self) {
        let expand = |p: &Path| PathBuf::from(expand_env_vars(&p.to_string_lossy()));
        self.run.log_dir = expand(&self.run.log_dir);
        self.data.train_path = expand(&self.data.train_path);
        self.data.population_path = self.data.population_path.as_deref().map(expand);
    }

    /// Number of models in the pool.
    ///
    /// Two models per split, with enough splits for every experiment and for
    /// `num_ref_models` references outside each target's own pair.
    pub fn pool_size(&self) -> usize {
        if let Some(n) = self.run.num_models {
            return n;
        }
        let pairs = self
            .run
            .num_experiments
            .div_ceil(2)
            .max(self.audit.num_ref_models + 1);
        pairs * 2
    }

    /// Target model indices, in experiment order.
    pub fn target_indices(&self) -> Vec<usize> {
        (0..self.run.num_experiments).collect()
    }

    pub fn report_dir(&self) -> PathBuf {
        self.run.log_dir.join("report")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run.log_dir.join("models")
    }

    pub fn signal_dir(&self) -> PathBuf {
        self.run.log_dir.join("signals")
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: String| {
            Err(ConfigError::Invalid {
                field: field.to_string(),
                reason,
            })
        };

        if self.run.num_experiments == 0 {
            return invalid("run.num_experiments", "must be at least 1".into());
        }
        let pool = self.pool_size();
        if pool < self.run.num_experiments {
            return invalid(
                "run.num_models",
                format!(
                    "pool of {pool} models cannot host {} experiments",
                    self.run.num_experiments
                ),
            );
        }

        if !(0.0..1.0).contains(&self.data.holdout_fraction) {
            return invalid("data.holdout_fraction", "must be in [0, 1)".into());
        }
        if self.data.num_classes == Some(0) {
            return invalid("data.num_classes", "must be at least 1".into());
        }

        if self.train.devices.is_empty() {
            return invalid("train.devices", "at least one device is required".into());
        }
        if self.train.epochs == 0 {
            return invalid("train.epochs", "must be at least 1".into());
        }
        if self.train.batch_size == 0 {
            return invalid("train.batch_size", "must be at least 1".into());
        }
        if !(self.train.learning_rate > 0.0 && self.train.learning_rate.is_finite()) {
            return invalid("train.learning_rate", "must be positive".into());
        }

        let audit = &self.audit;
        if audit.algorithm == AttackAlgorithm::Rmia {
            if audit.num_ref_models == 0 {
                return invalid(
                    "audit.num_ref_models",
                    "rmia needs at least one reference model".into(),
                );
            }
            if pool < audit.num_ref_models + 2 {
                return invalid(
                    "audit.num_ref_models",
                    format!(
                        "{} references do not fit a pool of {pool} models",
                        audit.num_ref_models
                    ),
                );
            }
        }
        if audit.data_size == Some(0) {
            return invalid("audit.data_size", "must be at least 1".into());
        }
        if audit.population_size == 0 {
            return invalid("audit.population_size", "must be at least 1".into());
        }
        if !(audit.gamma > 0.0 && audit.gamma.is_finite()) {
            return invalid("audit.gamma", "must be positive".into());
        }
        if audit.offline_a_grid.is_empty() {
            return invalid("audit.offline_a_grid", "grid is empty".into());
        }
        if let Some(a) = audit
            .offline_a_grid
            .iter()
            .chain(audit.offline_a.iter())
            .find(|a| !(0.0..=1.0).contains(*a))
        {
            return invalid("audit.offline_a", format!("{a} is outside [0, 1]"));
        }
        if audit.batch_size == 0 {
            return invalid("audit.batch_size", "must be at least 1".into());
        }
        if !(audit.temperature > 0.0 && audit.temperature.is_finite()) {
            return invalid("audit.temperature", "must be positive".into());
        }

        let ramia = &self.ramia;
        if ramia.enabled {
            if ramia.sample_size == 0 {
                return invalid("ramia.sample_size", "must be at least 1".into());
            }
            if !(ramia.radius >= 0.0 && ramia.radius.is_finite()) {
                return invalid("ramia.radius", "must be non-negative".into());
            }
            if !(0.0..1.0).contains(&ramia.trim_ratio) {
                return invalid("ramia.trim_ratio", "must be in [0, 1)".into());
            }
        }

        Ok(())
    }
}

static ENV_VAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        toml::from_str(
            r#"
            [run]
            log_dir = "runs/test"
            num_experiments = 3

            [data]
            train_path = "train.jsonl"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_example_config_parses_and_validates() {
        let config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.train.devices.len(), 2);
        assert_eq!(config.audit.offline_a_grid.len(), 11);
    }

    #[test]
    fn test_pool_size_follows_pairs() {
        let mut config = minimal();
        // ceil(3 / 2) = 2 pairs vs num_ref_models + 1 = 2 pairs
        assert_eq!(config.pool_size(), 4);

        config.audit.num_ref_models = 4;
        assert_eq!(config.pool_size(), 10);

        config.run.num_models = Some(5);
        assert_eq!(config.pool_size(), 5);
    }

    #[test]
    fn test_validate_rejects_zero_references_for_rmia() {
        let mut config = minimal();
        config.audit.num_ref_models = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "audit.num_ref_models"));

        config.audit.algorithm = AttackAlgorithm::Loss;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_grid() {
        let mut config = minimal();
        config.audit.offline_a_grid = vec![0.0, 1.5];
        assert!(config.validate().is_err());

        config.audit.offline_a_grid = vec![];
        assert!(config.validate().is_err());

        config.audit.offline_a_grid = default_offline_a_grid();
        config.audit.offline_a = Some(-0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_devices() {
        let mut config = minimal();
        config.train.devices.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: test-local variable name, no other thread reads it.
        unsafe { std::env::set_var("PRIVAUDIT_TEST_ROOT", "/scratch") };
        assert_eq!(
            expand_env_vars("${PRIVAUDIT_TEST_ROOT}/runs"),
            "/scratch/runs"
        );
        assert_eq!(expand_env_vars("${PRIVAUDIT_UNSET_VAR}/x"), "${PRIVAUDIT_UNSET_VAR}/x");
    }
}
