//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (legacy exam platform).
    pub source: StoreConfig,

    /// Target database configuration (restructured schema).
    pub target: StoreConfig,

    /// Pipeline-wide behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Extractor tuning.
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Transformer policy constants.
    #[serde(default)]
    pub transform: TransformConfig,

    /// Load orchestrator tuning.
    #[serde(default)]
    pub load: LoadConfig,

    /// Reconciliation checks.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// PostgreSQL connection settings, shared by source and target.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Pipeline-wide behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Directory for raw extraction artifacts. Transformed artifacts go to `<data_dir>/transformed`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Generic batch size for inserts (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Academy that owns every migrated row (default: 1).
    #[serde(default = "default_academy_id")]
    pub target_academy_id: i64,

    /// Re-extract tables even when a valid artifact exists.
    #[serde(default)]
    pub force_download: bool,

    /// Disable non-essential target triggers during the large loads.
    #[serde(default)]
    pub suspend_triggers: bool,

    /// Which stages run.
    #[serde(default)]
    pub stages: StageToggles,

    /// Maximum connections per store pool (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_size: default_batch_size(),
            target_academy_id: default_academy_id(),
            force_download: false,
            suspend_triggers: false,
            stages: StageToggles::default(),
            max_connections: default_max_connections(),
        }
    }
}

impl MigrationConfig {
    /// Directory holding transformed artifacts.
    pub fn transformed_dir(&self) -> PathBuf {
        self.data_dir.join("transformed")
    }
}

/// Per-stage enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToggles {
    #[serde(default = "default_true")]
    pub extract: bool,
    #[serde(default = "default_true")]
    pub transform: bool,
    #[serde(default = "default_true")]
    pub load: bool,
    #[serde(default = "default_true")]
    pub reconcile: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            extract: true,
            transform: true,
            load: true,
            reconcile: true,
        }
    }
}

impl StageToggles {
    /// True when at least one stage is enabled.
    pub fn any(&self) -> bool {
        self.extract || self.transform || self.load || self.reconcile
    }
}

/// Extractor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Rows per source page (default: 500).
    #[serde(default = "default_batch_size")]
    pub page_size: usize,

    /// Maximum rows per output partition for partitioned tables (default: 50000).
    #[serde(default = "default_partition_rows")]
    pub partition_rows: usize,

    /// Tables extracted into multiple partitions.
    #[serde(default = "default_partitioned_tables")]
    pub partitioned_tables: Vec<String>,

    /// Attempts per page before the table fails (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base in seconds; attempt n waits unit * 2^n (default: 5).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Consecutive empty pages that end a partitioned extraction (default: 5).
    #[serde(default = "default_empty_page_tolerance")]
    pub empty_page_tolerance: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            page_size: default_batch_size(),
            partition_rows: default_partition_rows(),
            partitioned_tables: default_partitioned_tables(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
            empty_page_tolerance: default_empty_page_tolerance(),
        }
    }
}

/// Flags that collapse a topic into one topic type, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationRule {
    /// `isPsychoTechnical` set.
    Psychotechnical,
    /// `isOfficial` set.
    Official,
    /// `isSpecial` set.
    Special,
    /// Sequence number at or below `mock_threshold`.
    StudyBlock,
    /// `isMock` set.
    Mock,
}

/// Transformer policy constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Topics numbered at or below this go to the study block (default: 45).
    #[serde(default = "default_mock_threshold")]
    pub mock_threshold: i64,

    /// Offset added to flashcard ids so they never collide with question ids.
    #[serde(default = "default_flashcard_offset")]
    pub flashcard_id_offset: i64,

    /// Rows per transformed answer chunk (default: 100000).
    #[serde(default = "default_answer_chunk_rows")]
    pub answer_chunk_rows: usize,

    /// Classification priority; first matching rule wins.
    #[serde(default = "default_category_priority")]
    pub category_priority: Vec<ClassificationRule>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            mock_threshold: default_mock_threshold(),
            flashcard_id_offset: default_flashcard_offset(),
            answer_chunk_rows: default_answer_chunk_rows(),
            category_priority: default_category_priority(),
        }
    }
}

/// Load orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Questions per commit in the insert-then-fill loop (default: 100).
    #[serde(default = "default_question_commit")]
    pub question_commit_interval: usize,

    /// Users per commit (default: 500).
    #[serde(default = "default_batch_size")]
    pub user_commit_interval: usize,

    /// User tests per commit (default: 500).
    #[serde(default = "default_batch_size")]
    pub user_test_batch_size: usize,

    /// Answers per bulk stream (default: 5000).
    #[serde(default = "default_answer_batch")]
    pub answer_batch_size: usize,

    /// Number of error messages shown per table (default: 5).
    #[serde(default = "default_error_preview")]
    pub error_preview: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            question_commit_interval: default_question_commit(),
            user_commit_interval: default_batch_size(),
            user_test_batch_size: default_batch_size(),
            answer_batch_size: default_answer_batch(),
            error_preview: default_error_preview(),
        }
    }
}

/// One ratio check between a source and a target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioCheck {
    pub source: String,
    pub target: String,
    pub ratio: f64,
}

/// A target table whose size is fixed by policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralCheck {
    pub target: String,
    pub expected: i64,
}

/// Reconciliation checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Allowed absolute deviation from the expected ratio (default: 0.01).
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_ratio_checks")]
    pub checks: Vec<RatioCheck>,

    #[serde(default = "default_literal_checks")]
    pub literal_checks: Vec<LiteralCheck>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            checks: default_ratio_checks(),
            literal_checks: default_literal_checks(),
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_batch_size() -> usize {
    500
}

fn default_academy_id() -> i64 {
    1
}

fn default_max_connections() -> usize {
    4
}

fn default_partition_rows() -> usize {
    50_000
}

fn default_partitioned_tables() -> Vec<String> {
    vec!["user_test_answers".to_string()]
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_empty_page_tolerance() -> u32 {
    5
}

fn default_mock_threshold() -> i64 {
    45
}

fn default_flashcard_offset() -> i64 {
    30_000_000
}

fn default_answer_chunk_rows() -> usize {
    100_000
}

fn default_category_priority() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::Psychotechnical,
        ClassificationRule::Official,
        ClassificationRule::Special,
        ClassificationRule::StudyBlock,
        ClassificationRule::Mock,
    ]
}

fn default_question_commit() -> usize {
    100
}

fn default_answer_batch() -> usize {
    5_000
}

fn default_error_preview() -> usize {
    5
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_ratio_checks() -> Vec<RatioCheck> {
    [
        ("categories", "categories", 1.0),
        ("topics", "topic", 1.0),
        ("questions", "questions", 1.0),
        ("questions", "question_options", 3.0),
        ("users", "users", 1.0),
        ("user_tests", "user_tests", 1.0),
        ("user_test_answers", "user_test_answers", 1.0),
        ("users_favorite_questions", "user_favorite_questions", 1.0),
    ]
    .into_iter()
    .map(|(source, target, ratio)| RatioCheck {
        source: source.to_string(),
        target: target.to_string(),
        ratio,
    })
    .collect()
}

fn default_literal_checks() -> Vec<LiteralCheck> {
    vec![LiteralCheck {
        target: "topic_type".to_string(),
        expected: 5,
    }]
}
