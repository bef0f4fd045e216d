//! Cross-experiment aggregation and report artifacts.
//!
//! Layout of one run:
//!
//! ```text
//! report/<timestamp>_<id>/
//!   exp_<t>/result.json
//!   exp_<t>/roc.csv
//!   summary.json        (when aggregated)
//!   roc_mean.csv        (when aggregated)
//! ```
//!
//! Every file is created exactly once; an existing file is an error.

use super::metrics::roc_curve;
use crate::models::{AggregateReport, AuditError, MetricSummary, Result, RocPoint, TargetAudit};
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Points of the log-spaced FPR grid between 1e-5 and 1.
const GRID_POINTS: usize = 51;

/// 0 followed by log-spaced values from 1e-5 to 1.
pub fn fpr_grid() -> Vec<f64> {
    let step = 5.0 / (GRID_POINTS - 1) as f64;
    std::iter::once(0.0)
        .chain((0..GRID_POINTS).map(|i| 10f64.powf(-5.0 + step * i as f64)))
        .collect()
}

fn summarize(values: &[f64]) -> MetricSummary {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    MetricSummary {
        mean,
        std: var.sqrt(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Aggregates target audits and writes run artifacts.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    report_root: PathBuf,
}

impl ResultAggregator {
    pub fn new(report_root: impl Into<PathBuf>) -> Self {
        Self {
            report_root: report_root.into(),
        }
    }

    /// Mean, population std and extremes of each metric, plus the mean ROC.
    pub fn aggregate(audits: &[TargetAudit]) -> Result<AggregateReport> {
        if audits.is_empty() {
            return Err(AuditError::insufficient("no audits to aggregate"));
        }
        let metric = |f: fn(&TargetAudit) -> f64| summarize(&audits.iter().map(f).collect::<Vec<_>>());

        let curves = audits
            .iter()
            .map(|a| roc_curve(&a.scores, &a.labels))
            .collect::<Result<Vec<_>>>()?;
        let roc = fpr_grid()
            .into_iter()
            .map(|fpr| {
                let tprs: Vec<f64> = curves.iter().map(|c| c.interpolate(fpr)).collect();
                let s = summarize(&tprs);
                RocPoint {
                    fpr,
                    mean_tpr: s.mean,
                    std_tpr: s.std,
                }
            })
            .collect();

        Ok(AggregateReport {
            experiments: audits.len(),
            auc: metric(|a| a.metrics.auc),
            tpr_at_low_fpr: metric(|a| a.metrics.tpr_at_low_fpr),
            tpr_at_zero_fpr: metric(|a| a.metrics.tpr_at_zero_fpr),
            roc,
        })
    }

    /// Write per-experiment artifacts, then the summary if one is given.
    /// Returns the run directory.
    pub fn write_run(
        &self,
        audits: &[TargetAudit],
        summary: Option<&AggregateReport>,
    ) -> Result<PathBuf> {
        let run_dir = self.create_run_dir()?;

        for audit in audits {
            let exp_dir = run_dir.join(format!("exp_{}", audit.target));
            fs::create_dir(&exp_dir).map_err(|e| AuditError::io("creating experiment dir", e))?;
            write_json_once(&exp_dir.join("result.json"), audit)?;

            let curve = roc_curve(&audit.scores, &audit.labels)?;
            let mut csv = String::from("fpr,tpr,threshold\n");
            for ((f, t), th) in curve.fpr.iter().zip(&curve.tpr).zip(&curve.thresholds) {
                csv.push_str(&format!("{f},{t},{th}\n"));
            }
            write_once(&exp_dir.join("roc.csv"), csv.as_bytes())?;
        }

        if let Some(report) = summary {
            write_json_once(&run_dir.join("summary.json"), report)?;
            let mut csv = String::from("fpr,mean_tpr,std_tpr\n");
            for p in &report.roc {
                csv.push_str(&format!("{},{},{}\n", p.fpr, p.mean_tpr, p.std_tpr));
            }
            write_once(&run_dir.join("roc_mean.csv"), csv.as_bytes())?;
        }

        info!(dir = %run_dir.display(), experiments = audits.len(), "Report written");
        Ok(run_dir)
    }

    fn create_run_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.report_root)
            .map_err(|e| AuditError::io("creating report root", e))?;
        let id = Uuid::new_v4().simple().to_string();
        let name = format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &id[..8]);
        let dir = self.report_root.join(name);
        fs::create_dir(&dir).map_err(|e| AuditError::io("creating run dir", e))?;
        Ok(dir)
    }
}

fn create_new(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| AuditError::io(format!("creating {}", path.display()), e))
}

fn write_once(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = create_new(path)?;
    file.write_all(bytes)
        .map_err(|e| AuditError::io(format!("writing {}", path.display()), e))
}

fn write_json_once<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(create_new(path)?);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| AuditError::Internal(format!("Serializing {}: {e}", path.display())))?;
    writer
        .flush()
        .map_err(|e| AuditError::io(format!("writing {}", path.display()), e))
}
