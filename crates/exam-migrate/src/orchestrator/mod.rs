//! Pipeline orchestrator - runs the enabled stages in order.

use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::extract::{ExtractSummary, Extractor};
use crate::load::{LoadOrchestrator, LoadReport, TableStatus};
use crate::reconcile::{ReconciliationReport, Reconciler};
use crate::state::{RunContext, RunState, RunStatus, Stage, TableState};
use crate::store::{MemorySource, MemoryTarget, PgSource, PgTarget, SourceStore, TargetStore};
use crate::transform::{TransformSummary, Transformer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Migration pipeline: Extractor, Transformer, Load Orchestrator, Reconciler.
pub struct Pipeline {
    config: Config,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    state_file: Option<PathBuf>,
    state: Option<RunState>,
    cancel: CancellationToken,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Stages executed in this invocation.
    pub stages_run: Vec<String>,

    /// Stages skipped because they were disabled or already completed.
    pub stages_skipped: Vec<String>,

    /// Tables loaded (load stage only).
    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,

    /// Rows inserted or updated by the load stage.
    pub rows_loaded: u64,

    /// Records skipped across transform and load.
    pub rows_skipped: u64,

    /// Tables that failed, were blocked, or reported record errors.
    pub failed_tables: Vec<String>,

    pub extract: Vec<ExtractSummary>,
    pub transform: Option<TransformSummary>,
    pub load: Option<LoadReport>,
    pub reconcile: Option<ReconciliationReport>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every table loaded and every reconciliation check passed.
    pub fn success(&self) -> bool {
        self.failure().is_none()
    }

    /// Error describing why the run is not a full success.
    pub fn failure(&self) -> Option<MigrateError> {
        if !self.failed_tables.is_empty() {
            return Some(MigrateError::load(
                self.failed_tables.join(", "),
                "one or more tables failed to load",
            ));
        }
        self.reconcile.as_ref().and_then(ReconciliationReport::mismatch)
    }
}

/// Result of a store connectivity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
}

impl Pipeline {
    /// Connect the PostgreSQL stores the enabled stages need. A store no
    /// stage touches is replaced by an empty in-memory one.
    pub async fn connect(config: Config) -> Result<Self> {
        let stages = config.migration.stages;
        let target: Arc<dyn TargetStore> = if stages.load || stages.reconcile {
            Arc::new(PgTarget::new(&config.target, config.migration.max_connections).await?)
        } else {
            debug!("Target store not needed by the enabled stages");
            Arc::new(MemoryTarget::new())
        };
        Self::connect_source(config, target).await
    }

    /// Connect the source store and load into an in-memory copy of the
    /// target schema. Nothing is written to the target database.
    pub async fn connect_dry_run(config: Config) -> Result<Self> {
        info!("Dry run: loading into an in-memory target");
        Self::connect_source(config, Arc::new(MemoryTarget::exam_schema())).await
    }

    async fn connect_source(config: Config, target: Arc<dyn TargetStore>) -> Result<Self> {
        let stages = config.migration.stages;
        let source: Arc<dyn SourceStore> = if stages.extract || stages.reconcile {
            Arc::new(PgSource::new(&config.source, config.migration.max_connections).await?)
        } else {
            debug!("Source store not needed by the enabled stages");
            Arc::new(MemorySource::new())
        };
        Ok(Self::with_stores(config, source, target))
    }

    /// Build a pipeline over existing stores.
    pub fn with_stores(
        config: Config,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            state_file: None,
            state: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = RunState::load(path)?;
                state.validate_config(&self.config.hash())?;
                info!("Resuming run {} from state file: {:?}", state.run_id, path);
                self.state = Some(state);
            }
        }
        Ok(self)
    }

    fn raw_artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(&self.config.migration.data_dir)
    }

    fn transformed_artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(self.config.migration.transformed_dir())
    }

    fn stage_enabled(&self, stage: Stage) -> bool {
        let toggles = &self.config.migration.stages;
        match stage {
            Stage::Extract => toggles.extract,
            Stage::Transform => toggles.transform,
            Stage::Load => toggles.load,
            Stage::Reconcile => toggles.reconcile,
        }
    }

    /// Run every enabled stage.
    ///
    /// Table-level failures do not stop the run; they are reported in the
    /// result. Fatal errors (connection loss, cancellation, unreadable
    /// artifacts) end the run after the state file is saved.
    pub async fn run(mut self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut state = self
            .state
            .take()
            .unwrap_or_else(|| RunState::new(uuid::Uuid::new_v4().to_string(), self.config.hash()));
        let run_id = state.run_id.clone();
        info!("Starting migration run: {}", run_id);

        let mut ctx = RunContext::new(run_id.clone(), self.cancel.clone());
        let mut result = MigrationResult {
            run_id: run_id.clone(),
            status: "running".to_string(),
            duration_seconds: 0.0,
            started_at,
            completed_at: started_at,
            stages_run: Vec::new(),
            stages_skipped: Vec::new(),
            tables_total: 0,
            tables_success: 0,
            tables_failed: 0,
            rows_loaded: 0,
            rows_skipped: 0,
            failed_tables: Vec::new(),
            extract: Vec::new(),
            transform: None,
            load: None,
            reconcile: None,
        };

        for (phase, stage) in Stage::ALL.into_iter().enumerate() {
            if !self.stage_enabled(stage) {
                info!("Phase {}: {} disabled, skipping", phase + 1, stage);
                result.stages_skipped.push(stage.to_string());
                continue;
            }
            if state.is_stage_completed(stage) {
                info!("Phase {}: {} already completed, skipping", phase + 1, stage);
                result.stages_skipped.push(stage.to_string());
                continue;
            }

            info!("Phase {}: {}", phase + 1, stage);
            state.mark_stage_started(stage);
            self.save_state(&mut state)?;

            let outcome = self.run_stage(stage, &mut ctx, &mut state, &mut result).await;
            result.stages_run.push(stage.to_string());
            match outcome {
                Ok(None) => state.mark_stage_completed(stage),
                Ok(Some(problem)) => {
                    warn!("{} finished with problems: {}", stage, problem);
                    state.mark_stage_failed(stage, &problem);
                }
                Err(e) => {
                    error!("{} failed: {}", stage, e);
                    state.mark_stage_failed(stage, &e.to_string());
                    let status = if matches!(e, MigrateError::Cancelled) {
                        RunStatus::Cancelled
                    } else {
                        RunStatus::Failed
                    };
                    state.finish(status);
                    self.save_state(&mut state)?;
                    return Err(e);
                }
            }
            self.save_state(&mut state)?;
        }

        let completed_at = Utc::now();
        result.completed_at = completed_at;
        result.duration_seconds = start.elapsed().as_secs_f64();
        let status = if result.success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        result.status = match status {
            RunStatus::Completed => "completed",
            _ => "failed",
        }
        .to_string();
        state.finish(status);
        self.save_state(&mut state)?;

        info!(
            "Migration {}: {} stages, {} rows loaded, {} skipped in {:.1}s",
            result.status,
            result.stages_run.len(),
            result.rows_loaded,
            result.rows_skipped,
            result.duration_seconds
        );
        Ok(result)
    }

    /// Run one stage; `Ok(Some(..))` describes non-fatal problems.
    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &mut RunContext,
        state: &mut RunState,
        result: &mut MigrationResult,
    ) -> Result<Option<String>> {
        match stage {
            Stage::Extract => {
                let summaries = self.extract().await?;
                for s in &summaries {
                    state.record_table(
                        stage,
                        &s.table,
                        TableState {
                            rows: s.rows,
                            status: Some(if s.reused { "reused" } else { "extracted" }.to_string()),
                            ..Default::default()
                        },
                    );
                }
                result.extract = summaries;
                Ok(None)
            }
            Stage::Transform => {
                let summary = self.transform()?;
                for t in &summary.tables {
                    state.record_table(
                        stage,
                        &t.table,
                        TableState {
                            rows: t.output,
                            skipped: t.skipped.total,
                            ..Default::default()
                        },
                    );
                }
                result.rows_skipped += summary.total_skipped();
                result.transform = Some(summary);
                Ok(None)
            }
            Stage::Load => {
                let report = self.load(ctx).await?;
                for t in &report.tables {
                    state.record_table(
                        stage,
                        &t.table,
                        TableState {
                            rows: t.inserted + t.updated,
                            skipped: t.skipped.total,
                            errors: t.errors.total,
                            status: Some(
                                serde_json::to_value(t.status)
                                    .ok()
                                    .and_then(|v| v.as_str().map(str::to_string))
                                    .unwrap_or_default(),
                            ),
                        },
                    );
                }
                result.tables_total = report.tables.len();
                result.tables_success = report.tables.iter().filter(|t| t.is_clean()).count();
                result.tables_failed = result.tables_total - result.tables_success;
                result.rows_loaded = report.tables.iter().map(|t| t.inserted + t.updated).sum();
                result.rows_skipped += report.tables.iter().map(|t| t.skipped.total).sum::<u64>();
                result.failed_tables = report.failed_tables();
                let problem = (!report.success()).then(|| {
                    let blocked = report
                        .tables
                        .iter()
                        .filter(|t| t.status == TableStatus::Blocked)
                        .count();
                    format!(
                        "{} tables with problems ({} blocked)",
                        result.failed_tables.len(),
                        blocked
                    )
                });
                result.load = Some(report);
                Ok(problem)
            }
            Stage::Reconcile => {
                let report = self.reconcile().await?;
                for r in &report.results {
                    state.record_table(
                        stage,
                        &r.target_table,
                        TableState {
                            rows: r.target_count.unwrap_or(0).max(0) as u64,
                            status: Some(r.status.to_string()),
                            ..Default::default()
                        },
                    );
                }
                let problem = report.mismatch().map(|e| e.to_string());
                result.reconcile = Some(report);
                Ok(problem)
            }
        }
    }

    /// Extract every source table into raw artifacts.
    pub async fn extract(&self) -> Result<Vec<ExtractSummary>> {
        Extractor::new(
            Arc::clone(&self.source),
            self.raw_artifacts(),
            self.config.extract.clone(),
            self.config.migration.force_download,
        )
        .with_cancel(self.cancel.clone())
        .extract_all()
        .await
    }

    /// Transform raw artifacts into target-shaped artifacts.
    pub fn transform(&self) -> Result<TransformSummary> {
        Transformer::new(
            self.raw_artifacts(),
            self.transformed_artifacts(),
            self.config.transform.clone(),
            self.config.migration.target_academy_id,
        )
        .with_preview(self.config.load.error_preview)
        .with_cancel(self.cancel.clone())
        .transform_all()
    }

    /// Load transformed artifacts into the target.
    pub async fn load(&self, ctx: &mut RunContext) -> Result<LoadReport> {
        LoadOrchestrator::new(
            Arc::clone(&self.target),
            self.transformed_artifacts(),
            &self.config,
        )
        .load_all(ctx)
        .await
    }

    /// Run the configured reconciliation checks.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        Reconciler::new(
            Arc::clone(&self.source),
            Arc::clone(&self.target),
            self.config.reconcile.clone(),
        )
        .reconcile_all()
        .await
    }

    /// Check connectivity to both stores.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = self.target.ping().await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        let result = HealthCheckResult {
            healthy: source.is_ok() && target.is_ok(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        };
        if result.healthy {
            info!(
                "Health check passed ({} {}ms, {} {}ms)",
                self.source.db_type(),
                source_latency_ms,
                self.target.db_type(),
                target_latency_ms
            );
        } else {
            warn!("Health check failed");
        }
        Ok(result)
    }

    /// Save state to file.
    fn save_state(&self, state: &mut RunState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, stages: &str) -> Config {
        Config::from_yaml(&format!(
            r#"
source: {{ host: src, database: legacy, user: u }}
target: {{ host: dst, database: exam, user: u }}
migration:
  data_dir: {}
  stages: {}
reconcile:
  checks: []
  literal_checks: []
"#,
            dir.display(),
            stages
        ))
        .unwrap()
    }

    fn pipeline(config: Config) -> Pipeline {
        let source = crate::extract::SOURCE_TABLES
            .iter()
            .fold(MemorySource::new(), |s, t| s.with_table(t.name, Vec::new()));
        Pipeline::with_stores(config, Arc::new(source), Arc::new(MemoryTarget::exam_schema()))
    }

    #[tokio::test]
    async fn test_empty_run_completes_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let result = pipeline(config(dir.path(), "{}"))
            .with_state_file(state_file.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(result.status, "completed");
        assert_eq!(result.stages_run, vec!["extract", "transform", "load", "reconcile"]);
        assert!(result.success());

        let state = RunState::load(&state_file).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(Stage::ALL.iter().all(|s| state.is_stage_completed(*s)));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let cfg = config(dir.path(), "{ load: false, reconcile: false }");
        pipeline(cfg.clone())
            .with_state_file(state_file.clone())
            .run()
            .await
            .unwrap();

        let resumed = pipeline(config(dir.path(), "{}"))
            .with_state_file(state_file.clone())
            .resume()
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(resumed.stages_skipped, vec!["extract", "transform"]);
        assert_eq!(resumed.stages_run, vec!["load", "reconcile"]);
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_config() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        pipeline(config(dir.path(), "{ load: false, reconcile: false }"))
            .with_state_file(state_file.clone())
            .run()
            .await
            .unwrap();

        let mut changed = config(dir.path(), "{}");
        changed.migration.target_academy_id = 9;
        let err = pipeline(changed)
            .with_state_file(state_file)
            .resume()
            .err()
            .unwrap();
        assert!(matches!(err, MigrateError::ConfigChanged));
    }

    #[tokio::test]
    async fn test_cancelled_run_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline(config(dir.path(), "{}"))
            .with_state_file(state_file.clone())
            .with_cancel(cancel)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        let state = RunState::load(&state_file).unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_health_check_memory_stores() {
        let dir = tempfile::tempdir().unwrap();
        let health = pipeline(config(dir.path(), "{}")).health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.source_error.is_none());
    }
}
