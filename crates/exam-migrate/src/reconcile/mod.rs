//! Reconciler: read-only row count checks between source and target.
//!
//! Each ratio check compares `target_count / source_count` with an expected
//! ratio. Literal checks cover target tables created purely by policy. The
//! reconciler only counts, so it can be re-run at any time.

use crate::config::{LiteralCheck, RatioCheck, ReconcileConfig};
use crate::error::{MigrateError, Result};
use crate::store::{SourceStore, TargetStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Source empty but target not.
    Warning,
    /// A count could not be obtained.
    Error,
    /// Both sides empty.
    Skip,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Error => "ERROR",
            CheckStatus::Skip => "SKIP",
        };
        f.pad(s)
    }
}

/// One reconciliation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// Source table, or `None` for literal checks.
    pub source_table: Option<String>,
    pub target_table: String,
    pub source_count: Option<i64>,
    pub target_count: Option<i64>,
    pub ratio: Option<f64>,
    pub expected: f64,
    pub status: CheckStatus,
    pub message: Option<String>,
}

/// Classify a ratio check from its two counts.
pub fn classify_ratio(
    source_count: Option<i64>,
    target_count: Option<i64>,
    expected: f64,
    tolerance: f64,
) -> (CheckStatus, Option<f64>, Option<String>) {
    let (Some(source), Some(target)) = (source_count, target_count) else {
        return (
            CheckStatus::Error,
            None,
            Some("row count unavailable".to_string()),
        );
    };
    if source == 0 {
        return if target == 0 {
            (CheckStatus::Skip, None, None)
        } else {
            (
                CheckStatus::Warning,
                None,
                Some(format!("source empty but target has {} rows", target)),
            )
        };
    }

    let ratio = target as f64 / source as f64;
    if (ratio - expected).abs() < tolerance {
        (CheckStatus::Pass, Some(ratio), None)
    } else {
        (
            CheckStatus::Fail,
            Some(ratio),
            Some(format!("Ratio {:.2} != {:.2}", ratio, expected)),
        )
    }
}

/// All checks of one reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub results: Vec<ReconciliationResult>,
    pub duration_seconds: f64,
}

impl ReconciliationReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// No FAIL and no ERROR.
    pub fn success(&self) -> bool {
        self.count(CheckStatus::Fail) == 0 && self.count(CheckStatus::Error) == 0
    }

    pub fn get(&self, target_table: &str) -> Option<&ReconciliationResult> {
        self.results.iter().find(|r| r.target_table == target_table)
    }

    /// `ReconciliationMismatch` describing the failed checks, if any.
    pub fn mismatch(&self) -> Option<MigrateError> {
        if self.success() {
            return None;
        }
        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|r| matches!(r.status, CheckStatus::Fail | CheckStatus::Error))
            .map(|r| format!("{} {}", r.target_table, r.status))
            .collect();
        Some(MigrateError::ReconciliationMismatch(failed.join(", ")))
    }

    fn log(&self) {
        for r in &self.results {
            let source = r.source_table.as_deref().unwrap_or("-");
            let line = format!(
                "{:<8} {} -> {}: {:?} / {:?}{}",
                r.status,
                source,
                r.target_table,
                r.source_count,
                r.target_count,
                r.message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            );
            match r.status {
                CheckStatus::Pass | CheckStatus::Skip => info!("{}", line),
                CheckStatus::Warning => warn!("{}", line),
                CheckStatus::Fail | CheckStatus::Error => error!("{}", line),
            }
        }
        info!(
            "Reconciliation: {} pass, {} fail, {} warning, {} error, {} skip",
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Fail),
            self.count(CheckStatus::Warning),
            self.count(CheckStatus::Error),
            self.count(CheckStatus::Skip)
        );
    }
}

/// Counts rows on both stores and classifies each configured check.
pub struct Reconciler {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    /// Run every configured ratio and literal check.
    pub async fn reconcile_all(&self) -> Result<ReconciliationReport> {
        let start = Instant::now();
        info!(
            "Reconciling {} ratio checks and {} literal checks",
            self.config.checks.len(),
            self.config.literal_checks.len()
        );
        let mut results = self.reconcile(&self.config.checks).await;
        for check in &self.config.literal_checks {
            results.push(self.literal(check).await);
        }

        let report = ReconciliationReport {
            results,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        report.log();
        Ok(report)
    }

    /// Classify each ratio check. Counts are cached per table so a source
    /// table shared by several checks is counted once.
    pub async fn reconcile(&self, checks: &[RatioCheck]) -> Vec<ReconciliationResult> {
        let mut source_counts: HashMap<String, Option<i64>> = HashMap::new();
        let mut target_counts: HashMap<String, Option<i64>> = HashMap::new();
        let mut results = Vec::with_capacity(checks.len());

        for check in checks {
            let source_count = match source_counts.get(&check.source) {
                Some(count) => *count,
                None => {
                    let count = self.source_count(&check.source).await;
                    source_counts.insert(check.source.clone(), count);
                    count
                }
            };
            let target_count = match target_counts.get(&check.target) {
                Some(count) => *count,
                None => {
                    let count = self.target_count(&check.target).await;
                    target_counts.insert(check.target.clone(), count);
                    count
                }
            };

            let (status, ratio, message) =
                classify_ratio(source_count, target_count, check.ratio, self.config.tolerance);
            results.push(ReconciliationResult {
                source_table: Some(check.source.clone()),
                target_table: check.target.clone(),
                source_count,
                target_count,
                ratio,
                expected: check.ratio,
                status,
                message,
            });
        }
        results
    }

    async fn literal(&self, check: &LiteralCheck) -> ReconciliationResult {
        let target_count = self.target_count(&check.target).await;
        let (status, message) = match target_count {
            None => (CheckStatus::Error, Some("row count unavailable".to_string())),
            Some(n) if n == check.expected => (CheckStatus::Pass, None),
            Some(n) => (
                CheckStatus::Fail,
                Some(format!("Count {} != {}", n, check.expected)),
            ),
        };
        ReconciliationResult {
            source_table: None,
            target_table: check.target.clone(),
            source_count: None,
            target_count,
            ratio: None,
            expected: check.expected as f64,
            status,
            message,
        }
    }

    async fn source_count(&self, table: &str) -> Option<i64> {
        match self.source.count(table).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Could not count source {}: {}", table, e);
                None
            }
        }
    }

    async fn target_count(&self, table: &str) -> Option<i64> {
        match self.target.count(table).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Could not count target {}: {}", table, e);
                None
            }
        }
    }
}
