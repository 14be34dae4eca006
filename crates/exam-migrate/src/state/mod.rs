//! Run state and the context threaded through the stages.
//!
//! [`RunState`] is persisted as a JSON file after every stage so a re-run
//! can skip completed stages. [`RunContext`] carries everything a stage
//! shares with later stages during one process: identifier maps, the
//! cancellation token, and ids created by policy.

use crate::core::IdentifierMap;
use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Load,
    Reconcile,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Extract, Stage::Transform, Stage::Load, Stage::Reconcile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
            Stage::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Task status, for stages and tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-stage state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Per-table state within a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableState {
    pub rows: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub status: Option<String>,
}

/// Persisted progress of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub status: RunStatus,

    /// Per-stage progress.
    pub stages: BTreeMap<Stage, StageState>,

    /// Per-table progress, keyed by `<stage>.<table>`.
    pub tables: BTreeMap<String, TableState>,

    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the serialized state (without this field), keyed
    /// by the config hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl RunState {
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            stages: BTreeMap::new(),
            tables: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file, verifying its signature when present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match &state.hmac {
            Some(stored) => {
                if stored != &state.compute_hmac()? {
                    return Err(MigrateError::State(
                        "State file integrity check failed: HMAC mismatch".to_string(),
                    ));
                }
            }
            None => warn!("State file has no HMAC signature, integrity cannot be verified"),
        }
        Ok(state)
    }

    /// Save state (atomic write, signed).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Resume is only allowed with the configuration the run started with.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    pub fn is_stage_completed(&self, stage: Stage) -> bool {
        self.stages
            .get(&stage)
            .map(|s| s.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    pub fn mark_stage_started(&mut self, stage: Stage) {
        self.stages.insert(
            stage,
            StageState {
                status: TaskStatus::InProgress,
                completed_at: None,
                error: None,
            },
        );
    }

    pub fn mark_stage_completed(&mut self, stage: Stage) {
        self.stages.insert(
            stage,
            StageState {
                status: TaskStatus::Completed,
                completed_at: Some(Utc::now()),
                error: None,
            },
        );
    }

    pub fn mark_stage_failed(&mut self, stage: Stage, error: &str) {
        self.stages.insert(
            stage,
            StageState {
                status: TaskStatus::Failed,
                completed_at: None,
                error: Some(error.to_string()),
            },
        );
    }

    /// Record the outcome of one table within a stage.
    pub fn record_table(&mut self, stage: Stage, table: &str, entry: TableState) {
        self.tables.insert(format!("{}.{}", stage, table), entry);
    }

    pub fn table(&self, stage: Stage, table: &str) -> Option<&TableState> {
        self.tables.get(&format!("{}.{}", stage, table))
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// State shared between stages during one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    cancel: CancellationToken,
    id_maps: BTreeMap<String, IdentifierMap>,
    /// Id of the topic type holding flashcard stacks, once known.
    pub flashcard_topic_type: Option<i64>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            run_id: run_id.into(),
            cancel,
            id_maps: BTreeMap::new(),
            flashcard_topic_type: None,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    pub fn id_map(&self, source_table: &str) -> Option<&IdentifierMap> {
        self.id_maps.get(source_table)
    }

    /// The map for `source_table`, created empty on first use.
    pub fn id_map_mut(&mut self, source_table: &str) -> &mut IdentifierMap {
        self.id_maps
            .entry(source_table.to_string())
            .or_insert_with(|| IdentifierMap::new(source_table))
    }

    pub fn insert_id_map(&mut self, map: IdentifierMap) {
        self.id_maps.insert(map.source_table().to_string(), map);
    }
}
