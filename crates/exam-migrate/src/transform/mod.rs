//! Transformer: maps raw source artifacts to target-shaped artifacts.
//!
//! Reads the extractor's output, applies the per-entity policies in
//! [`entities`], and writes one artifact per target table plus the option
//! side-tables consumed by the load stage. Single bad records are skipped
//! and counted; only I/O and artifact errors stop the stage.

pub mod answers;
pub mod classify;
pub mod entities;
pub mod ordering;

pub use answers::{resolve_selection, Selection};
pub use entities::{OptionTuple, OptionsTable, OLD_ID};

use crate::artifacts::ArtifactStore;
use crate::config::TransformConfig;
use crate::core::{Row, RowExt, SkipLedger};
use crate::error::{MigrateError, Result};
use entities::EntityContext;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Artifact names written by the transformer and read by the loader.
pub mod outputs {
    pub const TOPIC_TYPES: &str = "topic_types";
    pub const ACADEMIES: &str = "academies";
    pub const CATEGORIES: &str = "categories";
    pub const TOPICS: &str = "topics";
    pub const QUESTIONS: &str = "questions";
    pub const QUESTION_OPTIONS: &str = "question_options";
    pub const FLASHCARD_TOPICS: &str = "flashcard_topics";
    pub const FLASHCARD_QUESTIONS: &str = "flashcard_questions";
    pub const FLASHCARD_OPTIONS: &str = "flashcard_options";
    pub const USERS: &str = "users";
    pub const USER_TESTS: &str = "user_tests";
    pub const ANSWERS: &str = super::answers::ANSWERS;
    pub const FAVORITES: &str = "user_favorite_questions";
    pub const CHALLENGES: &str = "challenges";
}

/// Per-table transformation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTransform {
    pub table: String,
    pub input: u64,
    pub output: u64,
    pub skipped: SkipLedger,
}

/// Outcome of a transform run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformSummary {
    pub tables: Vec<TableTransform>,
    pub duration_seconds: f64,
}

impl TransformSummary {
    pub fn table(&self, name: &str) -> Option<&TableTransform> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn total_skipped(&self) -> u64 {
        self.tables.iter().map(|t| t.skipped.total).sum()
    }
}

fn ids(rows: &[Row], column: &str) -> HashSet<i64> {
    rows.iter().filter_map(|r| r.get_i64(column)).collect()
}

/// Runs every entity policy over the raw artifacts.
pub struct Transformer {
    raw: ArtifactStore,
    out: ArtifactStore,
    config: TransformConfig,
    academy_id: i64,
    timestamp: String,
    preview: usize,
    cancel: CancellationToken,
}

impl Transformer {
    pub fn new(
        raw: ArtifactStore,
        out: ArtifactStore,
        config: TransformConfig,
        academy_id: i64,
    ) -> Self {
        Self {
            raw,
            out,
            config,
            academy_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            preview: crate::core::ledger::DEFAULT_PREVIEW,
            cancel: CancellationToken::new(),
        }
    }

    /// Fix the timestamp stamped on policy-created rows.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_preview(mut self, preview: usize) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    fn ledger(&self) -> SkipLedger {
        SkipLedger::with_preview(self.preview)
    }

    fn record(
        &self,
        summary: &mut TransformSummary,
        table: &str,
        input: usize,
        rows: &[Row],
        skipped: SkipLedger,
    ) -> Result<()> {
        self.out.write_table(table, rows)?;
        if skipped.is_empty() {
            info!("{}: {} -> {} rows", table, input, rows.len());
        } else {
            warn!(
                "{}: {} -> {} rows, {} skipped",
                table,
                input,
                rows.len(),
                skipped.total
            );
            for msg in &skipped.preview {
                warn!("  {}", msg);
            }
        }
        summary.tables.push(TableTransform {
            table: table.to_string(),
            input: input as u64,
            output: rows.len() as u64,
            skipped,
        });
        Ok(())
    }

    /// Transform every table.
    pub fn transform_all(&self) -> Result<TransformSummary> {
        let start = Instant::now();
        let mut summary = TransformSummary::default();
        let ctx = EntityContext {
            academy_id: self.academy_id,
            timestamp: &self.timestamp,
            config: &self.config,
        };

        let topic_types = entities::topic_types(&self.timestamp);
        self.record(&mut summary, outputs::TOPIC_TYPES, 0, &topic_types, self.ledger())?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("academies")?;
        let mut skipped = self.ledger();
        let rows = entities::academies(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::ACADEMIES, src.len(), &rows, skipped)?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("categories")?;
        let mut skipped = self.ledger();
        let rows = entities::categories(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::CATEGORIES, src.len(), &rows, skipped)?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("topics")?;
        let mut skipped = self.ledger();
        let rows = entities::topics(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::TOPICS, src.len(), &rows, skipped)?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("questions")?;
        let mut skipped = self.ledger();
        let (questions, options) = entities::questions(&src, &ctx, &mut skipped);
        self.out.write_json(outputs::QUESTION_OPTIONS, &options)?;
        self.record(&mut summary, outputs::QUESTIONS, src.len(), &questions, skipped)?;
        let known_questions = ids(&questions, "id");

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("flash_cards_stack")?;
        let mut skipped = self.ledger();
        let stacks = entities::flashcard_stacks(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::FLASHCARD_TOPICS, src.len(), &stacks, skipped)?;

        let src = self.raw.read_table_or_empty("flashcards")?;
        let mut skipped = self.ledger();
        if !src.is_empty() {
            if let Some(max) = known_questions.iter().max() {
                if *max >= self.config.flashcard_id_offset {
                    warn!(
                        "Question id {} reaches the flashcard id offset {}; colliding cards will be skipped",
                        max, self.config.flashcard_id_offset
                    );
                }
            }
        }
        let (cards, card_options) = entities::flashcards(
            &src,
            &ids(&stacks, OLD_ID),
            &known_questions,
            &ctx,
            &mut skipped,
        );
        self.out.write_json(outputs::FLASHCARD_OPTIONS, &card_options)?;
        self.record(&mut summary, outputs::FLASHCARD_QUESTIONS, src.len(), &cards, skipped)?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("users")?;
        let mut skipped = self.ledger();
        let users = entities::users(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::USERS, src.len(), &users, skipped)?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("user_tests")?;
        let mut skipped = self.ledger();
        let rows = entities::user_tests(&src, &ids(&users, "id"), &mut skipped);
        self.record(&mut summary, outputs::USER_TESTS, src.len(), &rows, skipped)?;

        self.checkpoint()?;
        let answers = answers::transform_answers(
            &self.raw,
            &self.out,
            &known_questions,
            self.config.answer_chunk_rows,
            self.preview,
        )?;
        summary.tables.push(TableTransform {
            table: outputs::ANSWERS.to_string(),
            input: answers.rows + answers.skipped.total,
            output: answers.rows,
            skipped: answers.skipped,
        });

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("users_favorite_questions")?;
        let mut skipped = self.ledger();
        let rows = entities::favorites(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::FAVORITES, src.len(), &rows, skipped)?;

        self.checkpoint()?;
        let src = self.raw.read_table_or_empty("challenges")?;
        let mut skipped = self.ledger();
        let rows = entities::challenges(&src, &ctx, &mut skipped);
        self.record(&mut summary, outputs::CHALLENGES, src.len(), &rows, skipped)?;

        summary.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "Transform complete: {} tables, {} records skipped",
            summary.tables.len(),
            summary.total_skipped()
        );
        Ok(summary)
    }
}
