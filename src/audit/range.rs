//! Range membership inference: scores of a sample's neighbourhood reduced to one.

use super::metrics::attack_metrics;
use crate::models::{AuditError, RangeConfig, Result, TargetAudit, TrimDirection};

/// Repeat each sample's membership once per neighbour.
pub fn repeat_membership(membership: &[Vec<bool>], k: usize) -> Vec<Vec<bool>> {
    membership
        .iter()
        .map(|row| {
            row.iter()
                .flat_map(|&m| std::iter::repeat_n(m, k))
                .collect()
        })
        .collect()
}

/// Mean of each consecutive group of `k` scores after dropping ⌊trim_ratio·k⌋.
pub fn trim_scores(
    scores: &[f64],
    k: usize,
    trim_ratio: f64,
    direction: TrimDirection,
) -> Result<Vec<f64>> {
    if k == 0 || scores.len() % k != 0 {
        return Err(AuditError::InvalidInput(format!(
            "{} scores do not form ranges of {k}",
            scores.len()
        )));
    }
    let drop = ((trim_ratio * k as f64).floor() as usize).min(k - 1);

    Ok(scores
        .chunks(k)
        .map(|range| {
            let mut sorted = range.to_vec();
            sorted.sort_by(f64::total_cmp);
            let kept = match direction {
                TrimDirection::Bottom => &sorted[drop..],
                TrimDirection::Top => &sorted[..k - drop],
            };
            kept.iter().sum::<f64>() / kept.len() as f64
        })
        .collect())
}

/// Collapse a neighbour-level audit into one score per range.
///
/// `labels` is the membership of the original samples.
pub fn reduce_ranges(
    audit: TargetAudit,
    config: &RangeConfig,
    labels: Vec<bool>,
) -> Result<TargetAudit> {
    let scores = trim_scores(
        &audit.scores,
        config.sample_size,
        config.trim_ratio,
        config.trim_direction,
    )?;
    let metrics = attack_metrics(&scores, &labels)?;
    Ok(TargetAudit {
        scores,
        labels,
        metrics,
        ..audit
    })
}
