//! Membership scoring against reference models and a population.
//!
//! RMIA scoring for target t and audited sample x:
//! - out-references: the first `num_ref` candidate models not trained on x
//! - `p_ref(x) = a·online(x) + (1−a)·offline(x)` with `online` the mean
//!   out-reference signal and `offline = (online + 1) / 2`
//! - `ℓ(x) = ln t(x) − ln p_ref(x)`
//! - score: fraction of population z with `ℓ(x) − ℓ(z) > ln γ`

use super::metrics::attack_metrics;
use crate::models::{
    AttackAlgorithm, AuditConfig, AuditError, Calibration, CalibrationPoint, ReferenceOrder,
    Result, TargetAudit,
};
use crate::signals::{SIGNAL_EPSILON, SignalTable};
use crate::split::SplitDesign;
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// Signals of one scored model and its reference estimate.
#[derive(Debug, Clone, Copy)]
pub struct RatioInputs<'a> {
    /// Scored model's signal on each audited sample
    pub target_x: &'a [f64],
    /// Mean out-reference signal on each audited sample
    pub reference_x: &'a [f64],
    /// Scored model's signal on each population sample
    pub target_z: &'a [f64],
    /// Mean out-reference signal on each population sample
    pub reference_z: &'a [f64],
}

/// RMIA scores of `inputs` under `offline_a`, plus the number of clipped
/// reference estimates.
pub fn rmia_scores(inputs: &RatioInputs<'_>, offline_a: f64, gamma: f64) -> (Vec<f64>, usize) {
    let mut clipped = 0usize;
    let mut log_ratio = |t: f64, online: f64| {
        let offline = (online + 1.0) / 2.0;
        let p_ref = offline_a * online + (1.0 - offline_a) * offline;
        let p_ref = if p_ref < SIGNAL_EPSILON {
            clipped += 1;
            SIGNAL_EPSILON
        } else {
            p_ref
        };
        t.ln() - p_ref.ln()
    };

    let mut population: Vec<f64> = inputs
        .target_z
        .iter()
        .zip(inputs.reference_z)
        .map(|(&t, &r)| log_ratio(t, r))
        .collect();
    population.sort_by(f64::total_cmp);

    let threshold = gamma.ln();
    let total = population.len() as f64;
    let scores: Vec<f64> = inputs
        .target_x
        .iter()
        .zip(inputs.reference_x)
        .map(|(&t, &r)| {
            let cut = log_ratio(t, r) - threshold;
            population.partition_point(|&z| z < cut) as f64 / total
        })
        .collect();
    (scores, clipped)
}

/// Sweep `grid` and keep the first `offline_a` with the highest AUC against
/// the proxy's labels.
pub fn calibrate_offline_a(
    proxy: usize,
    inputs: &RatioInputs<'_>,
    labels: &[bool],
    grid: &[f64],
    gamma: f64,
) -> Result<Calibration> {
    let mut curve = Vec::with_capacity(grid.len());
    let mut best: Option<CalibrationPoint> = None;
    for &offline_a in grid {
        let (scores, _) = rmia_scores(inputs, offline_a, gamma);
        let auc = attack_metrics(&scores, labels)?.auc;
        debug!(proxy, offline_a, auc, "Calibration point");
        let point = CalibrationPoint { offline_a, auc };
        if best.is_none_or(|b| auc > b.auc) {
            best = Some(point);
        }
        curve.push(point);
    }
    let best = best.ok_or_else(|| AuditError::InvalidInput("empty offline_a grid".into()))?;
    Ok(Calibration {
        proxy,
        best_offline_a: best.offline_a,
        best_auc: best.auc,
        curve,
    })
}

/// Candidate reference models for `target`, in preference order.
///
/// Excludes the target and its pair; keeps the first `2·num_ref`.
pub fn reference_candidates(
    target: usize,
    pairs: &[Option<usize>],
    num_ref: usize,
    order: ReferenceOrder,
) -> Vec<usize> {
    let pair = pairs.get(target).copied().flatten();
    let mut candidates: Vec<usize> = (0..pairs.len())
        .filter(|&m| m != target && Some(m) != pair)
        .collect();
    if order == ReferenceOrder::Nearest {
        candidates.sort_by_key(|&m| (m.abs_diff(target), m));
    }
    candidates.truncate(2 * num_ref);
    candidates
}

/// Model whose labels calibrate `target`: its pair, else the nearest other model.
pub fn proxy_for(target: usize, pairs: &[Option<usize>]) -> Option<usize> {
    pairs.get(target).copied().flatten().or_else(|| {
        (0..pairs.len())
            .filter(|&m| m != target)
            .min_by_key(|&m| (m.abs_diff(target), m))
    })
}

/// Scores target models' membership over an audit sample.
#[derive(Debug, Clone)]
pub struct AuditEngine {
    config: AuditConfig,
    /// Pair of each pool model, `None` for solo models
    pairs: Vec<Option<usize>>,
}

impl AuditEngine {
    pub fn new(config: AuditConfig, pairs: Vec<Option<usize>>) -> Self {
        Self { config, pairs }
    }

    pub fn from_design(config: AuditConfig, design: &SplitDesign) -> Self {
        let pairs = (0..design.num_models()).map(|m| design.pair_of(m)).collect();
        Self::new(config, pairs)
    }

    /// Audit every target. Results are in `targets` order.
    ///
    /// `membership` is `[model][sample position]` over the audited samples.
    pub fn audit(
        &self,
        targets: &[usize],
        signals: &SignalTable,
        population: &SignalTable,
        membership: &[Vec<bool>],
    ) -> Result<Vec<TargetAudit>> {
        self.check_shapes(targets, signals, population, membership)?;
        targets
            .par_iter()
            .map(|&target| self.audit_target(target, signals, population, membership))
            .collect()
    }

    fn check_shapes(
        &self,
        targets: &[usize],
        signals: &SignalTable,
        population: &SignalTable,
        membership: &[Vec<bool>],
    ) -> Result<()> {
        let models = self.pairs.len();
        if signals.num_models() != models || membership.len() != models {
            return Err(AuditError::InvalidInput(format!(
                "pool has {models} models, got {} signal rows and {} membership rows",
                signals.num_models(),
                membership.len()
            )));
        }
        if membership.iter().any(|row| row.len() != signals.num_samples()) {
            return Err(AuditError::InvalidInput(
                "membership rows do not match audited samples".into(),
            ));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= models) {
            return Err(AuditError::InvalidInput(format!("target {bad} is not in the pool")));
        }
        if self.config.algorithm == AttackAlgorithm::Rmia {
            if population.num_models() != models {
                return Err(AuditError::InvalidInput(format!(
                    "population signals cover {} of {models} models",
                    population.num_models()
                )));
            }
            if population.num_samples() == 0 {
                return Err(AuditError::insufficient("population is empty"));
            }
        }
        Ok(())
    }

    fn audit_target(
        &self,
        target: usize,
        signals: &SignalTable,
        population: &SignalTable,
        membership: &[Vec<bool>],
    ) -> Result<TargetAudit> {
        let labels = membership[target].clone();

        let (scores, offline_a, calibration) = match self.config.algorithm {
            AttackAlgorithm::Loss => (signals.model_row(target).to_vec(), None, None),
            AttackAlgorithm::Rmia => {
                let num_ref = self.config.num_ref_models;
                let candidates = self.candidates_for(target, num_ref)?;
                let reference_x = out_reference_means(&candidates, num_ref, signals, membership)?;
                let reference_z = population_reference_means(&candidates, num_ref, population);
                let inputs = RatioInputs {
                    target_x: signals.model_row(target),
                    reference_x: &reference_x,
                    target_z: population.model_row(target),
                    reference_z: &reference_z,
                };

                let (offline_a, calibration) = match self.config.offline_a {
                    Some(a) => (a, None),
                    None => {
                        let c = self.calibrate(target, signals, population, membership)?;
                        (c.best_offline_a, Some(c))
                    }
                };

                let (scores, clipped) = rmia_scores(&inputs, offline_a, self.config.gamma);
                if clipped > 0 {
                    warn!(target, clipped, "Reference estimates clipped to epsilon");
                }
                (scores, Some(offline_a), calibration)
            }
        };

        let metrics = attack_metrics(&scores, &labels)?;
        info!(
            target,
            auc = format!("{:.4}", metrics.auc),
            tpr_at_low_fpr = format!("{:.4}", metrics.tpr_at_low_fpr),
            tpr_at_zero_fpr = format!("{:.4}", metrics.tpr_at_zero_fpr),
            "Target audited"
        );

        Ok(TargetAudit {
            target,
            offline_a,
            calibration,
            scores,
            labels,
            metrics,
        })
    }

    fn candidates_for(&self, model: usize, num_ref: usize) -> Result<Vec<usize>> {
        if num_ref == 0 {
            return Err(AuditError::insufficient(
                "rmia needs at least one reference model",
            ));
        }
        let candidates =
            reference_candidates(model, &self.pairs, num_ref, self.config.reference_order);
        if candidates.is_empty() {
            return Err(AuditError::insufficient(format!(
                "no reference models available for model {model}"
            )));
        }
        Ok(candidates)
    }

    fn calibrate(
        &self,
        target: usize,
        signals: &SignalTable,
        population: &SignalTable,
        membership: &[Vec<bool>],
    ) -> Result<Calibration> {
        let proxy = proxy_for(target, &self.pairs).ok_or_else(|| {
            AuditError::insufficient(format!("no calibration proxy for model {target}"))
        })?;
        let candidates = self.candidates_for(proxy, 1)?;
        let reference_x = out_reference_means(&candidates, 1, signals, membership)?;
        let reference_z = population_reference_means(&candidates, 1, population);
        let inputs = RatioInputs {
            target_x: signals.model_row(proxy),
            reference_x: &reference_x,
            target_z: population.model_row(proxy),
            reference_z: &reference_z,
        };

        let calibration = calibrate_offline_a(
            proxy,
            &inputs,
            &membership[proxy],
            &self.config.offline_a_grid,
            self.config.gamma,
        )?;
        info!(
            target,
            proxy,
            offline_a = calibration.best_offline_a,
            auc = format!("{:.4}", calibration.best_auc),
            "offline_a calibrated"
        );
        Ok(calibration)
    }
}

/// Mean signal of each sample's first `num_ref` out-references.
fn out_reference_means(
    candidates: &[usize],
    num_ref: usize,
    signals: &SignalTable,
    membership: &[Vec<bool>],
) -> Result<Vec<f64>> {
    (0..signals.num_samples())
        .map(|i| {
            let outs: Vec<f64> = candidates
                .iter()
                .filter(|&&m| !membership[m][i])
                .take(num_ref)
                .map(|&m| signals.get(m, i))
                .collect();
            if outs.is_empty() {
                return Err(AuditError::insufficient(format!(
                    "audited sample at position {i} has no out-reference among models {candidates:?}"
                )));
            }
            Ok(outs.iter().sum::<f64>() / outs.len() as f64)
        })
        .collect()
}

/// Mean signal of the first `num_ref` candidates; no pool model trained on the population.
fn population_reference_means(
    candidates: &[usize],
    num_ref: usize,
    population: &SignalTable,
) -> Vec<f64> {
    let refs = &candidates[..num_ref.min(candidates.len())];
    (0..population.num_samples())
        .map(|z| refs.iter().map(|&m| population.get(m, z)).sum::<f64>() / refs.len() as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIGH: f64 = 0.9;
    const LOW: f64 = 0.1;

    fn pairs(n: usize) -> Vec<Option<usize>> {
        (0..n).map(|m| Some(m ^ 1)).collect()
    }

    fn table(values: Vec<Vec<f64>>, population: bool) -> SignalTable {
        let ids = (0..values.len()).map(|m| format!("m{m}")).collect();
        SignalTable::from_probabilities(ids, values, population).unwrap()
    }

    /// Four paired models over ten samples; model 0 trains on 0..5, model 2 on evens.
    fn membership() -> Vec<Vec<bool>> {
        let m0: Vec<bool> = (0..10).map(|i| i < 5).collect();
        let m2: Vec<bool> = (0..10).map(|i| i % 2 == 0).collect();
        let flip = |row: &Vec<bool>| row.iter().map(|b| !b).collect::<Vec<_>>();
        vec![m0.clone(), flip(&m0), m2.clone(), flip(&m2)]
    }

    fn memorizing_signals(membership: &[Vec<bool>]) -> SignalTable {
        let values = membership
            .iter()
            .map(|row| row.iter().map(|&m| if m { HIGH } else { LOW }).collect())
            .collect();
        table(values, false)
    }

    fn population(models: usize, value: f64) -> SignalTable {
        table(vec![vec![value; 8]; models], true)
    }

    fn engine(config: AuditConfig) -> AuditEngine {
        AuditEngine::new(config, pairs(4))
    }

    #[test]
    fn test_separable_signals_give_perfect_auc() {
        let membership = membership();
        let audits = engine(AuditConfig::default())
            .audit(&[0], &memorizing_signals(&membership), &population(4, LOW), &membership)
            .unwrap();

        let audit = &audits[0];
        assert_eq!(audit.scores.len(), 10);
        assert_eq!(audit.metrics.auc, 1.0);
        for (score, member) in audit.scores.iter().zip(&audit.labels) {
            assert_eq!(*score, if *member { 1.0 } else { 0.0 });
        }
        let calibration = audit.calibration.as_ref().unwrap();
        assert_eq!(calibration.proxy, 1);
        assert_eq!(calibration.curve.len(), 11);
        // every grid value ties at AUC 1: the first wins
        assert_eq!(calibration.best_offline_a, 0.0);
    }

    #[test]
    fn test_identical_signals_give_chance_auc() {
        let membership = membership();
        let signals = table(vec![vec![0.5; 10]; 4], false);
        let audits = engine(AuditConfig::default())
            .audit(&[0, 1], &signals, &population(4, 0.5), &membership)
            .unwrap();
        for audit in &audits {
            assert!(audit.scores.iter().all(|&s| s == 0.0));
            assert_eq!(audit.metrics.auc, 0.5);
        }
    }

    #[test]
    fn test_zero_references_is_insufficient() {
        let membership = membership();
        let config = AuditConfig {
            num_ref_models: 0,
            ..AuditConfig::default()
        };
        let err = engine(config)
            .audit(&[0], &memorizing_signals(&membership), &population(4, LOW), &membership)
            .unwrap_err();
        assert!(matches!(err, AuditError::InsufficientData(_)));
    }

    #[test]
    fn test_empty_population_is_insufficient() {
        let membership = membership();
        let empty = table(vec![vec![]; 4], true);
        let err = engine(AuditConfig::default())
            .audit(&[0], &memorizing_signals(&membership), &empty, &membership)
            .unwrap_err();
        assert!(matches!(err, AuditError::InsufficientData(_)));
    }

    #[test]
    fn test_scores_ignore_offline_a_when_references_are_constant() {
        let membership = membership();
        let mut values = vec![vec![1.0; 10]; 4];
        values[0] = (0..10).map(|i| 0.05 + 0.09 * i as f64).collect();
        values[1] = (0..10).map(|i| 0.9 - 0.08 * i as f64).collect();
        let signals = table(values, false);
        let mut pop = vec![vec![1.0; 8]; 4];
        pop[0] = (0..8).map(|i| 0.12 + 0.1 * i as f64).collect();
        pop[1] = (0..8).map(|i| 0.15 + 0.1 * i as f64).collect();
        let population = table(pop, true);

        let scores_at = |a: f64| {
            let config = AuditConfig {
                offline_a: Some(a),
                ..AuditConfig::default()
            };
            engine(config)
                .audit(&[0], &signals, &population, &membership)
                .unwrap()
                .remove(0)
                .scores
        };
        let base = scores_at(0.0);
        assert_eq!(base, scores_at(0.5));
        assert_eq!(base, scores_at(1.0));

        let swept = engine(AuditConfig::default())
            .audit(&[0], &signals, &population, &membership)
            .unwrap()
            .remove(0);
        let calibration = swept.calibration.unwrap();
        assert_eq!(calibration.proxy, 1);
        assert!(calibration.curve.len() > 1);
        assert!(calibration.curve.iter().all(|p| p.auc == calibration.curve[0].auc));
        assert_eq!(calibration.best_offline_a, calibration.curve[0].offline_a);
        assert_eq!(swept.scores, base);
    }

    #[test]
    fn test_gamma_raises_the_bar() {
        let membership = membership();
        let signals = memorizing_signals(&membership);
        let config = AuditConfig {
            gamma: 1e6,
            offline_a: Some(0.5),
            ..AuditConfig::default()
        };
        let audit = engine(config)
            .audit(&[0], &signals, &population(4, LOW), &membership)
            .unwrap()
            .remove(0);
        assert!(audit.scores.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_parallel_audit_matches_single_target_runs() {
        let membership = membership();
        let signals = memorizing_signals(&membership);
        let pop = population(4, LOW);
        let engine = engine(AuditConfig::default());

        let together = engine.audit(&[0, 1, 2, 3], &signals, &pop, &membership).unwrap();
        for (t, audit) in together.iter().enumerate() {
            let alone = engine.audit(&[t], &signals, &pop, &membership).unwrap().remove(0);
            assert_eq!(audit.target, t);
            assert_eq!(audit.scores, alone.scores);
            assert_eq!(audit.metrics, alone.metrics);
        }
    }

    #[test]
    fn test_loss_algorithm_scores_target_signal() {
        let membership = membership();
        let signals = memorizing_signals(&membership);
        let config = AuditConfig {
            algorithm: AttackAlgorithm::Loss,
            num_ref_models: 0,
            ..AuditConfig::default()
        };
        let audit = engine(config)
            .audit(&[2], &signals, &population(4, LOW), &membership)
            .unwrap()
            .remove(0);
        assert_eq!(audit.scores, signals.model_row(2));
        assert!(audit.offline_a.is_none());
        assert_eq!(audit.metrics.auc, 1.0);
    }

    #[test]
    fn test_reference_candidate_order() {
        let pairs = pairs(6);
        assert_eq!(
            reference_candidates(2, &pairs, 2, ReferenceOrder::Index),
            vec![0, 1, 4, 5]
        );
        assert_eq!(
            reference_candidates(2, &pairs, 2, ReferenceOrder::Nearest),
            vec![1, 0, 4, 5]
        );
        assert_eq!(
            reference_candidates(0, &pairs, 1, ReferenceOrder::Index),
            vec![2, 3]
        );
    }

    #[test]
    fn test_solo_target_uses_nearest_proxy() {
        let pairs = vec![Some(1), Some(0), None];
        assert_eq!(proxy_for(0, &pairs), Some(1));
        assert_eq!(proxy_for(2, &pairs), Some(1));
    }

    #[test]
    fn test_calibration_keeps_first_maximum() {
        let inputs = RatioInputs {
            target_x: &[0.9, 0.1],
            reference_x: &[0.1, 0.1],
            target_z: &[0.1],
            reference_z: &[0.1],
        };
        let calibration =
            calibrate_offline_a(1, &inputs, &[true, false], &[0.3, 0.7, 0.3], 1.0).unwrap();
        assert_eq!(calibration.best_offline_a, 0.3);
        assert_eq!(calibration.curve.len(), 3);
    }
}
