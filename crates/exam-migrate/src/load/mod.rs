//! Load orchestrator: writes transformed artifacts into the target store.
//!
//! Tables are loaded in the fixed order of [`LoadStep::ORDER`]. Rows are
//! written in transactions of a configured size; every record runs inside a
//! savepoint so a failing record (and the option slots filled for it) rolls
//! back alone. Constraint violations are classified by [`RecoveryPolicy`].
//! A table that fails outright blocks every table depending on it.

pub mod bulk;
pub mod recovery;
pub mod triggers;

pub use recovery::{RecoveryAction, RecoveryPolicy};
pub use triggers::TriggerSuspension;

use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::core::{IdentifierMap, Row, RowExt, SkipLedger};
use crate::error::{MigrateError, Result};
use crate::state::RunContext;
use crate::store::{SlotKey, SlotLayout, TargetStore, TargetTx};
use crate::transform::classify::FLASHCARD_TOPIC_TYPE;
use crate::transform::{outputs, OptionsTable, OLD_ID};
use bulk::AnswerStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Identifier map of user tests, persisted for the answer load.
pub const USER_TEST_MAP_FILE: &str = "user_test_id_old_to_new";
/// Identifier map of flashcard stacks to the topics created for them.
pub const STACK_MAP_FILE: &str = "flashcard_stack_id_old_to_new";

const SAVEPOINT: &str = "record";

/// One entry of the load plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStep {
    TopicTypes,
    Academies,
    Categories,
    Topics,
    Questions,
    FlashcardTopicType,
    FlashcardTopics,
    FlashcardQuestions,
    Users,
    UserTests,
    Answers,
    Favorites,
    Challenges,
}

impl LoadStep {
    /// Parent-before-child order.
    pub const ORDER: [LoadStep; 13] = [
        LoadStep::TopicTypes,
        LoadStep::Academies,
        LoadStep::Categories,
        LoadStep::Topics,
        LoadStep::Questions,
        LoadStep::FlashcardTopicType,
        LoadStep::FlashcardTopics,
        LoadStep::FlashcardQuestions,
        LoadStep::Users,
        LoadStep::UserTests,
        LoadStep::Answers,
        LoadStep::Favorites,
        LoadStep::Challenges,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LoadStep::TopicTypes => "topic_type",
            LoadStep::Academies => "academies",
            LoadStep::Categories => "categories",
            LoadStep::Topics => "topic",
            LoadStep::Questions => "questions",
            LoadStep::FlashcardTopicType => "flashcard_topic_type",
            LoadStep::FlashcardTopics => "flashcard_topics",
            LoadStep::FlashcardQuestions => "flashcard_questions",
            LoadStep::Users => "users",
            LoadStep::UserTests => "user_tests",
            LoadStep::Answers => "user_test_answers",
            LoadStep::Favorites => "user_favorite_questions",
            LoadStep::Challenges => "challenge",
        }
    }

    /// Steps that must have loaded for this one to be attempted.
    pub fn depends_on(&self) -> &'static [LoadStep] {
        use LoadStep::*;
        match self {
            TopicTypes | Academies | Users | FlashcardTopicType => &[],
            Categories => &[TopicTypes],
            Topics => &[TopicTypes, Categories],
            Questions => &[Topics],
            FlashcardTopics => &[FlashcardTopicType],
            FlashcardQuestions => &[FlashcardTopics],
            UserTests => &[Users],
            Answers => &[UserTests, Questions],
            Favorites => &[Users, Questions],
            Challenges => &[Users, Questions, Topics],
        }
    }
}

impl fmt::Display for LoadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Final state of one table's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    /// Not attempted because a table it depends on failed.
    Blocked,
}

/// Per-table load result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    pub table: String,
    pub status: TableStatus,
    pub inserted: u64,
    pub updated: u64,
    /// Option slots filled after their parent insert.
    pub slots_filled: u64,
    /// Option tuples with no generated slot to fill.
    pub slot_misses: u64,
    pub skipped: SkipLedger,
    pub errors: SkipLedger,
    pub message: Option<String>,
    pub duration_seconds: f64,
}

impl LoadResult {
    pub fn new(table: &str, preview: usize) -> Self {
        Self {
            table: table.to_string(),
            status: TableStatus::Completed,
            inserted: 0,
            updated: 0,
            slots_filled: 0,
            slot_misses: 0,
            skipped: SkipLedger::with_preview(preview),
            errors: SkipLedger::with_preview(preview),
            message: None,
            duration_seconds: 0.0,
        }
    }

    fn failed(table: &str, preview: usize, err: &MigrateError) -> Self {
        let mut result = Self::new(table, preview);
        result.status = TableStatus::Failed;
        result.message = Some(err.to_string());
        result
    }

    fn blocked(table: &str, preview: usize, by: &[&str]) -> Self {
        let mut result = Self::new(table, preview);
        result.status = TableStatus::Blocked;
        result.message = Some(format!("blocked by failed {}", by.join(", ")));
        result
    }

    /// Loaded with no record-level errors.
    pub fn is_clean(&self) -> bool {
        self.status == TableStatus::Completed && self.errors.is_empty()
    }

    fn log(&self) {
        match self.status {
            TableStatus::Completed => info!(
                "{}: {} inserted, {} updated, {} skipped, {} errors ({:.1}s)",
                self.table,
                self.inserted,
                self.updated,
                self.skipped.total,
                self.errors.total,
                self.duration_seconds
            ),
            TableStatus::Failed => error!(
                "{}: failed: {}",
                self.table,
                self.message.as_deref().unwrap_or("unknown error")
            ),
            TableStatus::Blocked => warn!(
                "{}: {}",
                self.table,
                self.message.as_deref().unwrap_or("blocked")
            ),
        }
        for msg in &self.errors.preview {
            warn!("  {}", msg);
        }
        if !self.skipped.is_empty() {
            debug!("{} skip reasons: {:?}", self.table, self.skipped.by_reason);
        }
    }
}

/// Results of a whole load stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub tables: Vec<LoadResult>,
    pub duration_seconds: f64,
}

impl LoadReport {
    pub fn get(&self, table: &str) -> Option<&LoadResult> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Every table loaded without failures or record errors.
    pub fn success(&self) -> bool {
        self.tables.iter().all(LoadResult::is_clean)
    }

    pub fn failed_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| !t.is_clean())
            .map(|t| t.table.clone())
            .collect()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.tables.iter().map(|t| t.inserted).sum()
    }
}

/// How the rows of one table are written.
struct RowPlan<'a> {
    name: &'a str,
    table: &'a str,
    commit_interval: usize,
    /// Fill option slots after each parent insert.
    slots: Option<(&'a SlotLayout, &'a OptionsTable)>,
}

enum Outcome {
    Inserted {
        new_id: Option<i64>,
        slots_filled: u64,
        slot_misses: u64,
    },
    Updated,
    Skipped {
        reason: String,
        detail: String,
    },
}

/// Counts of one batch, applied to the result only once it commits.
#[derive(Default)]
struct BatchCounts {
    inserted: u64,
    updated: u64,
    slots_filled: u64,
    slot_misses: u64,
    skipped: Vec<(String, String)>,
    errors: Vec<(String, String)>,
    captured: Vec<(i64, i64)>,
}

impl BatchCounts {
    fn apply(self, result: &mut LoadResult, capture: Option<&mut IdentifierMap>) -> Result<()> {
        result.inserted += self.inserted;
        result.updated += self.updated;
        result.slots_filled += self.slots_filled;
        result.slot_misses += self.slot_misses;
        for (reason, detail) in self.skipped {
            result.skipped.skip(&reason, detail);
        }
        for (reason, detail) in self.errors {
            result.errors.skip(&reason, detail);
        }
        if let Some(map) = capture {
            for (old, new) in self.captured {
                map.record(old, new)?;
            }
        }
        Ok(())
    }
}

fn record_label(row: &Row) -> String {
    row.field(OLD_ID)
        .or_else(|| row.field("id"))
        .map(|v| v.to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Runs the load plan against a target store.
pub struct LoadOrchestrator {
    target: Arc<dyn TargetStore>,
    artifacts: ArtifactStore,
    config: crate::config::LoadConfig,
    batch_size: usize,
    suspend_triggers: bool,
    recovery: RecoveryPolicy,
    timestamp: String,
}

impl LoadOrchestrator {
    pub fn new(target: Arc<dyn TargetStore>, artifacts: ArtifactStore, config: &Config) -> Self {
        Self {
            target,
            artifacts,
            config: config.load.clone(),
            batch_size: config.migration.batch_size,
            suspend_triggers: config.migration.suspend_triggers,
            recovery: RecoveryPolicy::exam_defaults(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_suspend_triggers(mut self, suspend: bool) -> Self {
        self.suspend_triggers = suspend;
        self
    }

    fn preview(&self) -> usize {
        self.config.error_preview
    }

    /// Load every table in plan order.
    ///
    /// Fatal errors (connection loss, cancellation) end the stage; any other
    /// table failure is recorded and its dependents are marked blocked.
    pub async fn load_all(&self, ctx: &mut RunContext) -> Result<LoadReport> {
        let start = Instant::now();
        let mut report = LoadReport::default();
        let mut suspension = TriggerSuspension::new(Arc::clone(&self.target));

        let outcome = self.run_plan(ctx, &mut suspension, &mut report).await;
        if suspension.is_active() {
            // Error path: re-enable without finalizing.
            suspension.restore().await;
        }
        outcome?;

        report.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "Load complete: {} rows inserted, {} tables with problems",
            report.rows_inserted(),
            report.failed_tables().len()
        );
        Ok(report)
    }

    async fn run_plan(
        &self,
        ctx: &mut RunContext,
        suspension: &mut TriggerSuspension,
        report: &mut LoadReport,
    ) -> Result<()> {
        let mut unavailable: HashSet<LoadStep> = HashSet::new();

        for step in LoadStep::ORDER {
            ctx.checkpoint()?;

            let blockers: Vec<&str> = step
                .depends_on()
                .iter()
                .filter(|d| unavailable.contains(d))
                .map(|d| d.name())
                .collect();
            if !blockers.is_empty() {
                let result = LoadResult::blocked(step.name(), self.preview(), &blockers);
                result.log();
                unavailable.insert(step);
                report.tables.push(result);
                continue;
            }

            if step == LoadStep::UserTests && self.suspend_triggers {
                suspension.suspend().await?;
            }

            let result = match self.load_step(step, ctx).await {
                Ok(result) => result,
                Err(e @ (MigrateError::Cancelled | MigrateError::Connection { .. })) => return Err(e),
                Err(e) => LoadResult::failed(step.name(), self.preview(), &e),
            };
            result.log();
            if result.status != TableStatus::Completed {
                unavailable.insert(step);
            }
            report.tables.push(result);

            if step == LoadStep::Answers && suspension.is_active() {
                report.tables.push(self.end_suspension(suspension, report).await);
            }
        }

        // User tests never ran (blocked), so answers never closed the window.
        if suspension.is_active() {
            report.tables.push(self.end_suspension(suspension, report).await);
        }
        Ok(())
    }

    /// Re-enable triggers, then run the recompute passes.
    async fn end_suspension(
        &self,
        suspension: &mut TriggerSuspension,
        report: &LoadReport,
    ) -> LoadResult {
        let mut result = LoadResult::new("finalize", self.preview());
        let restored = suspension.restore().await;
        if !restored {
            result.status = TableStatus::Failed;
            result.message = Some("failed to re-enable triggers".to_string());
            return result;
        }
        let tests_loaded = report
            .get(LoadStep::UserTests.name())
            .is_some_and(|r| r.status == TableStatus::Completed);
        if !tests_loaded {
            result.status = TableStatus::Blocked;
            result.message = Some("user tests did not load".to_string());
            return result;
        }
        match suspension.finalize().await {
            Ok(affected) => result.updated = affected,
            Err(e) => {
                result.status = TableStatus::Failed;
                result.message = Some(e.to_string());
            }
        }
        result.log();
        result
    }

    /// Load a single plan step.
    pub async fn load_step(&self, step: LoadStep, ctx: &mut RunContext) -> Result<LoadResult> {
        let start = Instant::now();
        info!("Loading {}", step);
        let mut result = match step {
            LoadStep::TopicTypes => {
                self.load_table(step, "topic_type", outputs::TOPIC_TYPES, ctx).await?
            }
            LoadStep::Academies => {
                let result = self.load_table(step, "academies", outputs::ACADEMIES, ctx).await?;
                self.target.reset_sequence("academies", "id").await?;
                result
            }
            LoadStep::Categories => {
                let result = self.load_table(step, "categories", outputs::CATEGORIES, ctx).await?;
                self.target.reset_sequence("categories", "id").await?;
                result
            }
            LoadStep::Topics => self.load_table(step, "topic", outputs::TOPICS, ctx).await?,
            LoadStep::Questions => {
                let rows = self.artifacts.read_table_or_empty(outputs::QUESTIONS)?;
                self.load_questions(step, rows, outputs::QUESTION_OPTIONS, ctx)
                    .await?
            }
            LoadStep::FlashcardTopicType => self.load_flashcard_topic_type(ctx).await?,
            LoadStep::FlashcardTopics => self.load_flashcard_topics(ctx).await?,
            LoadStep::FlashcardQuestions => self.load_flashcard_questions(ctx).await?,
            LoadStep::Users => {
                let rows = self.artifacts.read_table_or_empty(outputs::USERS)?;
                let plan = RowPlan {
                    name: step.name(),
                    table: "users",
                    commit_interval: self.config.user_commit_interval,
                    slots: None,
                };
                let result = self.load_rows(&plan, rows, None, ctx).await?;
                self.target.reset_sequence("users", "id").await?;
                result
            }
            LoadStep::UserTests => self.load_user_tests(ctx).await?,
            LoadStep::Answers => self.load_answers(ctx).await?,
            LoadStep::Favorites => {
                self.load_table(step, "user_favorite_questions", outputs::FAVORITES, ctx)
                    .await?
            }
            LoadStep::Challenges => {
                self.load_table(step, "challenge", outputs::CHALLENGES, ctx).await?
            }
        };
        result.duration_seconds = start.elapsed().as_secs_f64();
        Ok(result)
    }

    /// Plain table: insert every row of an artifact in generic batches.
    async fn load_table(
        &self,
        step: LoadStep,
        table: &str,
        artifact: &str,
        ctx: &RunContext,
    ) -> Result<LoadResult> {
        let rows = self.artifacts.read_table_or_empty(artifact)?;
        let plan = RowPlan {
            name: step.name(),
            table,
            commit_interval: self.batch_size,
            slots: None,
        };
        self.load_rows(&plan, rows, None, ctx).await
    }

    fn question_layout(&self) -> Result<SlotLayout> {
        self.target.slot_layout("questions").ok_or_else(|| {
            MigrateError::Validation(format!(
                "{} target does not generate option slots for questions",
                self.target.db_type()
            ))
        })
    }

    async fn load_questions(
        &self,
        step: LoadStep,
        rows: Vec<Row>,
        options_artifact: &str,
        ctx: &RunContext,
    ) -> Result<LoadResult> {
        let layout = self.question_layout()?;
        let options: OptionsTable = self.artifacts.read_json(options_artifact)?.unwrap_or_default();
        let plan = RowPlan {
            name: step.name(),
            table: "questions",
            commit_interval: self.config.question_commit_interval,
            slots: Some((&layout, &options)),
        };
        self.load_rows(&plan, rows, None, ctx).await
    }

    /// Look up the Flashcards topic type, creating it when absent. Nothing
    /// is created when there are no stacks to hold.
    async fn load_flashcard_topic_type(&self, ctx: &mut RunContext) -> Result<LoadResult> {
        let mut result = LoadResult::new(LoadStep::FlashcardTopicType.name(), self.preview());
        let stacks = self.artifacts.read_table_or_empty(outputs::FLASHCARD_TOPICS)?;
        if stacks.is_empty() {
            info!("No flashcard stacks, Flashcards topic type not needed");
            return Ok(result);
        }

        let mut filter = Row::new();
        filter.insert("topic_type_name".into(), json!(FLASHCARD_TOPIC_TYPE.name));

        // Explicit ids 1..=5 do not advance the sequence.
        self.target.reset_sequence("topic_type", "id").await?;
        let mut tx = self.target.begin().await?;
        let existing = tx.select_i64("topic_type", "id", &filter).await?;
        let id = match existing.first() {
            Some(id) => {
                info!("Using existing Flashcards topic type {}", id);
                *id
            }
            None => {
                let row = FLASHCARD_TOPIC_TYPE.to_row(&self.timestamp);
                let id = tx.insert("topic_type", &row, Some("id")).await?.ok_or_else(|| {
                    MigrateError::load("topic_type", "insert returned no id")
                })?;
                result.inserted = 1;
                info!("Created Flashcards topic type {}", id);
                id
            }
        };
        tx.commit().await?;
        ctx.flashcard_topic_type = Some(id);
        Ok(result)
    }

    async fn load_flashcard_topics(&self, ctx: &mut RunContext) -> Result<LoadResult> {
        let mut rows = self.artifacts.read_table_or_empty(outputs::FLASHCARD_TOPICS)?;
        if rows.is_empty() {
            return Ok(LoadResult::new(LoadStep::FlashcardTopics.name(), self.preview()));
        }
        let topic_type = ctx.flashcard_topic_type.ok_or_else(|| {
            MigrateError::load("flashcard_topics", "Flashcards topic type unknown")
        })?;
        for row in &mut rows {
            row.insert("topic_type_id".into(), json!(topic_type));
        }

        self.target.reset_sequence("topic", "id").await?;
        let plan = RowPlan {
            name: LoadStep::FlashcardTopics.name(),
            table: "topic",
            commit_interval: self.batch_size,
            slots: None,
        };
        let mut map = ctx
            .id_map("flash_cards_stack")
            .cloned()
            .unwrap_or_else(|| IdentifierMap::new("flash_cards_stack"));
        let outcome = self.load_rows(&plan, rows, Some(&mut map), ctx).await;
        map.save(self.artifacts.table_path(STACK_MAP_FILE))?;
        ctx.insert_id_map(map);
        outcome
    }

    async fn load_flashcard_questions(&self, ctx: &mut RunContext) -> Result<LoadResult> {
        let rows = self.artifacts.read_table_or_empty(outputs::FLASHCARD_QUESTIONS)?;
        let stacks = match ctx.id_map("flash_cards_stack") {
            Some(map) => map.clone(),
            None => IdentifierMap::load(
                "flash_cards_stack",
                self.artifacts.table_path(STACK_MAP_FILE),
            )?,
        };

        let mut unmapped = SkipLedger::with_preview(self.preview());
        let mut mapped = Vec::with_capacity(rows.len());
        for mut row in rows {
            let resolved = match row.get_i64("topic") {
                Some(stack) => stacks.resolve(stack).map_err(|e| e.to_string()),
                None => Err("no stack".to_string()),
            };
            match resolved {
                Ok(topic) => {
                    row.insert("topic".into(), json!(topic));
                    mapped.push(row);
                }
                Err(detail) => unmapped.skip(
                    "unmapped_stack",
                    format!("flashcard {}: {}", record_label(&row), detail),
                ),
            }
        }

        let mut result = self
            .load_questions(
                LoadStep::FlashcardQuestions,
                mapped,
                outputs::FLASHCARD_OPTIONS,
                ctx,
            )
            .await?;
        result.skipped.merge(unmapped);
        Ok(result)
    }

    async fn load_user_tests(&self, ctx: &mut RunContext) -> Result<LoadResult> {
        let mut rows = self.artifacts.read_table_or_empty(outputs::USER_TESTS)?;
        if self.suspend_triggers {
            // Finalized afterwards by the recompute pass.
            for row in &mut rows {
                row.insert("finalized".into(), Value::Bool(false));
            }
        }

        let plan = RowPlan {
            name: LoadStep::UserTests.name(),
            table: "user_tests",
            commit_interval: self.config.user_test_batch_size,
            slots: None,
        };
        let mut map = ctx
            .id_map("user_tests")
            .cloned()
            .unwrap_or_else(|| IdentifierMap::new("user_tests"));
        let outcome = self.load_rows(&plan, rows, Some(&mut map), ctx).await;
        map.save(self.artifacts.table_path(USER_TEST_MAP_FILE))?;
        info!("Persisted {} user test id mappings", map.len());
        ctx.insert_id_map(map);
        outcome
    }

    async fn load_answers(&self, ctx: &mut RunContext) -> Result<LoadResult> {
        let map = match ctx.id_map("user_tests") {
            Some(map) => map.clone(),
            None => IdentifierMap::load("user_tests", self.artifacts.table_path(USER_TEST_MAP_FILE))?,
        };
        let stream = AnswerStream {
            target: Arc::clone(&self.target),
            artifacts: &self.artifacts,
            batch_size: self.config.answer_batch_size.max(1),
            preview: self.preview(),
            cancel: ctx.cancel_token().clone(),
        };
        stream.run(&map).await
    }

    /// Write rows in transactions of `commit_interval` records.
    ///
    /// Identifier pairs are recorded into `capture` only once their batch
    /// has committed.
    async fn load_rows(
        &self,
        plan: &RowPlan<'_>,
        rows: Vec<Row>,
        mut capture: Option<&mut IdentifierMap>,
        ctx: &RunContext,
    ) -> Result<LoadResult> {
        let mut result = LoadResult::new(plan.name, self.preview());
        if rows.is_empty() {
            debug!("{}: nothing to load", plan.name);
            return Ok(result);
        }
        let interval = plan.commit_interval.max(1);
        let batches = rows.len().div_ceil(interval);

        for (index, batch) in rows.chunks(interval).enumerate() {
            ctx.checkpoint()?;
            match self.write_batch(plan, batch, capture.is_some()).await {
                Ok(counts) => {
                    counts.apply(&mut result, capture.as_deref_mut())?;
                    debug!("{}: committed batch {}/{}", plan.name, index + 1, batches);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("{}: batch {} rolled back: {}", plan.name, index + 1, e);
                    result
                        .errors
                        .skip_many("batch_failed", batch.len() as u64, e.to_string());
                }
            }
        }
        Ok(result)
    }

    async fn write_batch(&self, plan: &RowPlan<'_>, batch: &[Row], capture: bool) -> Result<BatchCounts> {
        let mut counts = BatchCounts::default();
        let mut tx = self.target.begin().await?;

        for row in batch {
            let old_id = row.get_i64(OLD_ID);
            let mut clean = row.clone();
            clean.remove(OLD_ID);

            match self.write_record(tx.as_mut(), plan, &clean, capture).await {
                Ok(Outcome::Inserted {
                    new_id,
                    slots_filled,
                    slot_misses,
                }) => {
                    counts.inserted += 1;
                    counts.slots_filled += slots_filled;
                    counts.slot_misses += slot_misses;
                    if let (Some(old), Some(new)) = (old_id, new_id) {
                        counts.captured.push((old, new));
                    }
                }
                Ok(Outcome::Updated) => counts.updated += 1,
                Ok(Outcome::Skipped { reason, detail }) => {
                    warn!("{} {} skipped: {}", plan.name, record_label(row), detail);
                    counts.skipped.push((reason, format!("{} {}: {}", plan.name, record_label(row), detail)));
                }
                Err(e) if e.is_fatal() => {
                    if let Err(rb) = tx.rollback().await {
                        debug!("rollback after fatal error failed: {}", rb);
                    }
                    return Err(e);
                }
                Err(e) => {
                    let reason = e.constraint().unwrap_or("error").to_string();
                    counts
                        .errors
                        .push((reason, format!("{} {}: {}", plan.name, record_label(row), e)));
                }
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Write one record inside its own savepoint, applying the recovery
    /// policy when the first attempt violates a known constraint.
    async fn write_record(
        &self,
        tx: &mut dyn TargetTx,
        plan: &RowPlan<'_>,
        row: &Row,
        capture: bool,
    ) -> Result<Outcome> {
        tx.savepoint(SAVEPOINT).await?;
        let err = match self.insert_record(tx, plan, row, capture).await {
            Ok(outcome) => {
                tx.release(SAVEPOINT).await?;
                return Ok(outcome);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tx.rollback_to(SAVEPOINT).await?;
                e
            }
        };

        let outcome = match self.recovery.action_for(&err).cloned() {
            None => Err(err),
            Some(RecoveryAction::Skip { reason }) => Ok(Outcome::Skipped {
                reason,
                detail: err.to_string(),
            }),
            Some(RecoveryAction::RetryWithFieldCleared { column }) => {
                warn!("{}: {}, retrying without {}", plan.name, err, column);
                let retry = recovery::clear_field(row, &column);
                self.retry(tx, plan, &retry, capture).await
            }
            Some(RecoveryAction::RetryWithIdSuffix { column }) => match recovery::suffix_with_id(row, &column) {
                Some(retry) => {
                    debug!("{}: {}, retrying with suffixed {}", plan.name, err, column);
                    self.retry(tx, plan, &retry, capture).await
                }
                None => Err(err),
            },
            Some(RecoveryAction::FallbackUpdate { key }) => match recovery::fallback_update(row, &key) {
                Some((filter, fields)) => match tx.update(plan.table, &filter, &fields).await {
                    Ok(_) => Ok(Outcome::Updated),
                    Err(e) => {
                        tx.rollback_to(SAVEPOINT).await?;
                        Err(e)
                    }
                },
                None => Ok(Outcome::Skipped {
                    reason: "already_present".to_string(),
                    detail: err.to_string(),
                }),
            },
        };
        tx.release(SAVEPOINT).await?;
        outcome
    }

    async fn retry(
        &self,
        tx: &mut dyn TargetTx,
        plan: &RowPlan<'_>,
        row: &Row,
        capture: bool,
    ) -> Result<Outcome> {
        match self.insert_record(tx, plan, row, capture).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tx.rollback_to(SAVEPOINT).await?;
                Err(e)
            }
        }
    }

    /// Insert a record; for slot-generating parents, fill the generated
    /// slots from the options side-table.
    async fn insert_record(
        &self,
        tx: &mut dyn TargetTx,
        plan: &RowPlan<'_>,
        row: &Row,
        capture: bool,
    ) -> Result<Outcome> {
        let Some((layout, options)) = plan.slots else {
            let new_id = tx
                .insert(plan.table, row, capture.then_some("id"))
                .await?;
            return Ok(Outcome::Inserted {
                new_id,
                slots_filled: 0,
                slot_misses: 0,
            });
        };

        let keys = tx.insert_with_slots(layout, row).await?;
        let parent_id = match (keys.first(), row.get_i64("id")) {
            (Some(key), _) => key.parent_id,
            (None, Some(id)) => id,
            (None, None) => return Err(MigrateError::load(plan.table, "inserted row has no id")),
        };

        let mut filled = 0;
        let mut misses = 0;
        let tuples = options
            .get(&parent_id.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for tuple in tuples {
            let key = SlotKey {
                parent_id,
                ordinal: tuple.order,
            };
            if !keys.contains(&key) {
                warn!(
                    "{} {}: no slot for option {}, leaving it out",
                    plan.name, parent_id, tuple.order
                );
                misses += 1;
                continue;
            }
            let mut fields = Row::new();
            fields.insert("answer".into(), json!(tuple.answer));
            fields.insert("is_correct".into(), json!(tuple.is_correct));
            filled += tx.fill_slot(layout, key, &fields).await?;
        }

        Ok(Outcome::Inserted {
            new_id: Some(parent_id),
            slots_filled: filled,
            slot_misses: misses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::record::row;
    use crate::store::MemoryTarget;
    use crate::transform::OptionTuple;
    use tokio_util::sync::CancellationToken;

    fn config() -> Config {
        Config::from_yaml(
            r#"
source: { host: src, database: legacy, user: u }
target: { host: dst, database: exam, user: u }
migration: { batch_size: 2 }
load: { question_commit_interval: 2, user_commit_interval: 2, user_test_batch_size: 2, answer_batch_size: 2 }
"#,
        )
        .unwrap()
    }

    fn ctx() -> RunContext {
        RunContext::new("test", CancellationToken::new())
    }

    fn setup(memory: MemoryTarget) -> (tempfile::TempDir, ArtifactStore, Arc<MemoryTarget>, LoadOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        let memory = Arc::new(memory);
        let orchestrator = LoadOrchestrator::new(memory.clone(), artifacts.clone(), &config());
        (dir, artifacts, memory, orchestrator)
    }

    fn options(n: i64, correct: i64) -> Vec<OptionTuple> {
        (1..=n)
            .map(|order| OptionTuple {
                order,
                answer: format!("answer {}", order),
                is_correct: order == correct,
            })
            .collect()
    }

    fn base_target() -> MemoryTarget {
        MemoryTarget::exam_schema()
            .with_rows("topic_type", vec![row([("id", json!(1))])])
            .with_rows("topic", vec![row([("id", json!(3)), ("options", json!(3))])])
    }

    #[tokio::test]
    async fn test_question_slots_filled_by_ordinal() {
        let (_dir, artifacts, memory, orchestrator) = setup(base_target());
        artifacts
            .write_table(outputs::QUESTIONS, &[row([("id", json!(7)), ("topic", json!(3))])])
            .unwrap();
        let table: OptionsTable = [("7".to_string(), options(3, 2))].into_iter().collect();
        artifacts.write_json(outputs::QUESTION_OPTIONS, &table).unwrap();

        let result = orchestrator.load_step(LoadStep::Questions, &mut ctx()).await.unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.slots_filled, 3);
        assert_eq!(result.slot_misses, 0);

        let slots = memory.rows("question_options");
        assert_eq!(slots.len(), 3);
        let correct: Vec<i64> = slots
            .iter()
            .filter(|s| s["is_correct"] == json!(true))
            .map(|s| s["option_order"].as_i64().unwrap())
            .collect();
        assert_eq!(correct, vec![2]);
        assert_eq!(slots[0]["answer"], json!("answer 1"));
    }

    #[tokio::test]
    async fn test_slot_miss_is_counted_not_inserted() {
        let (_dir, artifacts, memory, orchestrator) = setup(base_target());
        artifacts
            .write_table(outputs::QUESTIONS, &[row([("id", json!(8)), ("topic", json!(3))])])
            .unwrap();
        let table: OptionsTable = [("8".to_string(), options(4, 4))].into_iter().collect();
        artifacts.write_json(outputs::QUESTION_OPTIONS, &table).unwrap();

        let result = orchestrator.load_step(LoadStep::Questions, &mut ctx()).await.unwrap();
        assert_eq!(result.slots_filled, 3);
        assert_eq!(result.slot_misses, 1);
        assert_eq!(memory.rows("question_options").len(), 3);
    }

    #[tokio::test]
    async fn test_failed_record_rolls_back_alone() {
        let (_dir, artifacts, memory, orchestrator) = setup(base_target());
        artifacts
            .write_table(
                outputs::QUESTIONS,
                &[
                    row([("id", json!(1)), ("topic", json!(3))]),
                    row([("id", json!(2)), ("topic", json!(99))]),
                ],
            )
            .unwrap();
        artifacts.write_json(outputs::QUESTION_OPTIONS, &OptionsTable::new()).unwrap();

        let result = orchestrator.load_step(LoadStep::Questions, &mut ctx()).await.unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.errors.count("questions_topic_fkey"), 1);
        assert_eq!(memory.rows("questions").len(), 1);
        // Only the surviving question's slots exist.
        assert_eq!(memory.rows("question_options").len(), 3);
    }

    #[tokio::test]
    async fn test_username_conflict_falls_back_to_update() {
        let target = MemoryTarget::exam_schema().with_rows(
            "users",
            vec![row([("id", json!(900)), ("username", json!("ana")), ("question_goal", json!(10))])],
        );
        let (_dir, artifacts, memory, orchestrator) = setup(target);
        artifacts
            .write_table(
                outputs::USERS,
                &[
                    row([("id", json!(1)), ("username", json!("ana")), ("question_goal", json!(80))]),
                    row([("id", json!(2)), ("username", json!("luis"))]),
                ],
            )
            .unwrap();

        let result = orchestrator.load_step(LoadStep::Users, &mut ctx()).await.unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.updated, 1);
        let users = memory.rows("users");
        let ana = users.iter().find(|u| u["username"] == json!("ana")).unwrap();
        assert_eq!(ana["id"], json!(900));
        assert_eq!(ana["question_goal"], json!(80));
    }

    #[tokio::test]
    async fn test_challenge_recovery_policies() {
        let target = MemoryTarget::exam_schema()
            .with_rows("users", vec![row([("id", json!(1))])])
            .with_rows("questions", vec![row([("id", json!(7))])])
            .with_rows("cms_users", vec![row([("id", json!(1)), ("user_uuid", json!("known"))])]);
        let (_dir, artifacts, memory, orchestrator) = setup(target);
        artifacts
            .write_table(
                outputs::CHALLENGES,
                &[
                    row([("user_id", json!(1)), ("question_id", json!(7)), ("tutor_uuid", json!("ghost"))]),
                    row([("user_id", json!(1)), ("question_id", json!(7)), ("tutor_uuid", json!("known"))]),
                    row([("user_id", json!(2)), ("question_id", json!(7))]),
                ],
            )
            .unwrap();

        let result = orchestrator.load_step(LoadStep::Challenges, &mut ctx()).await.unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.skipped.count("missing_user"), 1);
        assert!(result.errors.is_empty());

        let rows = memory.rows("challenge");
        assert_eq!(rows[0]["tutor_uuid"], Value::Null);
        assert_eq!(rows[1]["tutor_uuid"], json!("known"));
    }

    #[tokio::test]
    async fn test_academy_slug_conflict_retries_with_id() {
        let target = MemoryTarget::exam_schema().with_rows(
            "academies",
            vec![row([("id", json!(1)), ("slug", json!("policia"))])],
        );
        let (_dir, artifacts, memory, orchestrator) = setup(target);
        artifacts
            .write_table(
                outputs::ACADEMIES,
                &[
                    row([("id", json!(1)), ("name", json!("Policia")), ("slug", json!("policia"))]),
                    row([("id", json!(2)), ("name", json!("Policia")), ("slug", json!("policia"))]),
                ],
            )
            .unwrap();

        let result = orchestrator.load_step(LoadStep::Academies, &mut ctx()).await.unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(result.inserted, 1);
        let slugs: Vec<Value> = memory.rows("academies").iter().map(|a| a["slug"].clone()).collect();
        assert_eq!(slugs, vec![json!("policia"), json!("policia-2")]);
    }

    #[tokio::test]
    async fn test_user_tests_capture_and_persist_ids() {
        let target = MemoryTarget::exam_schema()
            .with_rows("users", vec![row([("id", json!(1))])])
            .with_rows("user_tests", vec![row([("id", json!(10)), ("user_id", json!(1))])]);
        let (_dir, artifacts, memory, orchestrator) = setup(target);
        artifacts
            .write_table(
                outputs::USER_TESTS,
                &[
                    row([(OLD_ID, json!(55)), ("user_id", json!(1)), ("finalized", json!(true))]),
                    row([(OLD_ID, json!(56)), ("user_id", json!(1))]),
                    row([(OLD_ID, json!(57)), ("user_id", json!(1))]),
                ],
            )
            .unwrap();

        let mut ctx = ctx();
        let orchestrator = orchestrator.with_suspend_triggers(true);
        let result = orchestrator.load_step(LoadStep::UserTests, &mut ctx).await.unwrap();
        assert_eq!(result.inserted, 3);

        let map = ctx.id_map("user_tests").unwrap();
        assert_eq!(map.get(55), Some(11));
        assert_eq!(map.get(57), Some(13));

        let persisted =
            IdentifierMap::load("user_tests", artifacts.table_path(USER_TEST_MAP_FILE)).unwrap();
        assert_eq!(persisted, map.clone());

        let tests = memory.rows("user_tests");
        assert!(tests.iter().all(|t| t.get(OLD_ID).is_none()));
        assert_eq!(tests[1]["finalized"], json!(false));
    }

    #[tokio::test]
    async fn test_failed_parent_blocks_dependents() {
        // No schema rows for topics: the topic artifact is corrupt.
        let (_dir, artifacts, _memory, orchestrator) = setup(MemoryTarget::exam_schema());
        artifacts.write_table(outputs::TOPIC_TYPES, &[]).unwrap();
        std::fs::write(artifacts.table_path(outputs::TOPICS), "[{").unwrap();

        let report = orchestrator.load_all(&mut ctx()).await.unwrap();
        assert_eq!(report.get("topic").unwrap().status, TableStatus::Failed);
        assert_eq!(report.get("questions").unwrap().status, TableStatus::Blocked);
        assert_eq!(report.get("challenge").unwrap().status, TableStatus::Blocked);
        assert_eq!(report.get("user_test_answers").unwrap().status, TableStatus::Blocked);
        assert_eq!(report.get("users").unwrap().status, TableStatus::Completed);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_flashcards_create_type_and_remap_topics() {
        let target = MemoryTarget::exam_schema().with_rows(
            "topic_type",
            (1..=5).map(|id| row([("id", json!(id))])).collect(),
        );
        let (_dir, artifacts, memory, orchestrator) = setup(target);
        artifacts
            .write_table(
                outputs::FLASHCARD_TOPICS,
                &[row([(OLD_ID, json!(2)), ("options", json!(2)), ("topic_type_id", Value::Null)])],
            )
            .unwrap();
        artifacts
            .write_table(
                outputs::FLASHCARD_QUESTIONS,
                &[
                    row([("id", json!(30_000_005)), ("topic", json!(2))]),
                    row([("id", json!(30_000_006)), ("topic", json!(77))]),
                ],
            )
            .unwrap();
        let table: OptionsTable = [("30000005".to_string(), options(2, 0))].into_iter().collect();
        artifacts.write_json(outputs::FLASHCARD_OPTIONS, &table).unwrap();

        let mut ctx = ctx();
        let result = orchestrator
            .load_step(LoadStep::FlashcardTopicType, &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(ctx.flashcard_topic_type, Some(6));

        orchestrator.load_step(LoadStep::FlashcardTopics, &mut ctx).await.unwrap();
        let topics = memory.rows("topic");
        assert_eq!(topics[0]["topic_type_id"], json!(6));
        let topic_id = topics[0]["id"].as_i64().unwrap();

        let result = orchestrator
            .load_step(LoadStep::FlashcardQuestions, &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.slots_filled, 2);
        assert_eq!(result.skipped.count("unmapped_stack"), 1);
        assert!(result
            .skipped
            .preview
            .iter()
            .any(|m| m.contains("No mapping for flash_cards_stack id 77")));
        assert_eq!(memory.rows("questions")[0]["topic"], json!(topic_id));

        // A second lookup reuses the existing type.
        let again = orchestrator
            .load_step(LoadStep::FlashcardTopicType, &mut ctx)
            .await
            .unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(memory.rows("topic_type").len(), 6);
    }
}
