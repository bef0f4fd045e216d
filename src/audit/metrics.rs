//! ROC analysis of membership scores.

use crate::models::{AttackMetrics, AuditError, Result};

/// FPR bound for [`AttackMetrics::tpr_at_low_fpr`].
pub const LOW_FPR: f64 = 0.001;

/// ROC curve with one point per distinct score, starting at (0, 0).
///
/// Intermediate collinear points are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Score at or above which a sample is called a member; `+inf` for the origin
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    /// Area under the curve (trapezoidal rule).
    pub fn auc(&self) -> f64 {
        self.fpr
            .windows(2)
            .zip(self.tpr.windows(2))
            .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
            .sum()
    }

    /// Highest TPR among points with FPR strictly below `limit`.
    pub fn tpr_below(&self, limit: f64) -> f64 {
        self.points()
            .filter(|(f, _)| *f < limit)
            .map(|(_, t)| t)
            .fold(0.0, f64::max)
    }

    /// Highest TPR among points with FPR exactly zero.
    pub fn tpr_at_zero_fpr(&self) -> f64 {
        self.points()
            .filter(|(f, _)| *f == 0.0)
            .map(|(_, t)| t)
            .fold(0.0, f64::max)
    }

    /// Linearly interpolated TPR at `fpr`. At a vertical segment the upper end wins.
    pub fn interpolate(&self, fpr: f64) -> f64 {
        let last = self.fpr.len() - 1;
        if fpr >= self.fpr[last] {
            return self.tpr[last];
        }
        let k = self.fpr.partition_point(|&f| f <= fpr).saturating_sub(1);
        if self.fpr[k] == fpr {
            return self.tpr[k];
        }
        let (x0, x1) = (self.fpr[k], self.fpr[k + 1]);
        let (y0, y1) = (self.tpr[k], self.tpr[k + 1]);
        y0 + (y1 - y0) * (fpr - x0) / (x1 - x0)
    }

    fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.fpr.iter().copied().zip(self.tpr.iter().copied())
    }
}

/// ROC curve of `scores` against membership `labels`.
///
/// Samples with equal scores share one threshold.
pub fn roc_curve(scores: &[f64], labels: &[bool]) -> Result<RocCurve> {
    if scores.len() != labels.len() {
        return Err(AuditError::InvalidInput(format!(
            "{} scores for {} labels",
            scores.len(),
            labels.len()
        )));
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(AuditError::InvalidInput("NaN membership score".into()));
    }
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(AuditError::insufficient(format!(
            "ROC needs both classes, got {positives} members and {negatives} non-members"
        )));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut curve = RocCurve {
        fpr: vec![0.0],
        tpr: vec![0.0],
        thresholds: vec![f64::INFINITY],
    };
    let (mut tp, mut fp) = (0usize, 0usize);
    for (rank, &i) in order.iter().enumerate() {
        if labels[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        let group_ends = order
            .get(rank + 1)
            .is_none_or(|&next| scores[next] != scores[i]);
        if group_ends {
            curve.fpr.push(fp as f64 / negatives as f64);
            curve.tpr.push(tp as f64 / positives as f64);
            curve.thresholds.push(scores[i]);
        }
    }
    Ok(curve)
}

/// AUC and low-FPR TPRs of one attack.
pub fn attack_metrics(scores: &[f64], labels: &[bool]) -> Result<AttackMetrics> {
    let curve = roc_curve(scores, labels)?;
    Ok(AttackMetrics {
        auc: curve.auc(),
        tpr_at_low_fpr: curve.tpr_below(LOW_FPR),
        tpr_at_zero_fpr: curve.tpr_at_zero_fpr(),
    })
}
