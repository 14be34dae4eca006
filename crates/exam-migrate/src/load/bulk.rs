//! Bulk stream path for answers.
//!
//! Answers need no dependent rows, so they bypass the row-by-row loop. Each
//! transformed chunk is mapped and streamed in batches: the user test id is
//! rewritten through the identifier map and the option ordinal is resolved
//! against the option slots the target generated for the question.

use super::LoadResult;
use crate::artifacts::ArtifactStore;
use crate::core::{IdentifierMap, Row, RowExt};
use crate::error::{MigrateError, Result};
use crate::store::{SlotLayout, TargetStore};
use crate::transform::answers::{ANSWERS, ANSWER_COLUMNS, ORDINAL};
use crate::transform::{resolve_selection, Selection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Streams transformed answers into the target.
pub struct AnswerStream<'a> {
    pub target: Arc<dyn TargetStore>,
    pub artifacts: &'a ArtifactStore,
    pub batch_size: usize,
    pub preview: usize,
    pub cancel: CancellationToken,
}

/// Map one transformed answer to its column values, or the skip reason.
pub fn map_answer(
    answer: &Row,
    user_tests: &IdentifierMap,
    slots: &HashMap<i64, Vec<i64>>,
) -> std::result::Result<Vec<Value>, (&'static str, String)> {
    let Some(old_test) = answer.get_i64("user_test_id") else {
        return Err(("unmapped_user_test", "answer without user_test_id".to_string()));
    };
    let user_test_id = user_tests
        .resolve(old_test)
        .map_err(|e| ("unmapped_user_test", e.to_string()))?;
    let Some(question_id) = answer.get_i64("question_id") else {
        return Err(("missing_question", "answer without question_id".to_string()));
    };

    let selected = match resolve_selection(
        answer.get_i64(ORDINAL),
        slots.get(&question_id).map(Vec::as_slice),
    ) {
        Selection::Empty => Value::Null,
        Selection::Option(id) => Value::from(id),
        Selection::NoOptions => {
            return Err((
                "question_without_options",
                format!("question {} has no options", question_id),
            ))
        }
        Selection::OutOfRange { ordinal, options } => {
            return Err((
                "invalid_ordinal",
                format!(
                    "answer {} invalid for question {} ({} options)",
                    ordinal, question_id, options
                ),
            ))
        }
    };

    Ok(vec![
        Value::from(user_test_id),
        Value::from(question_id),
        selected,
        answer.value("question_order"),
        Value::Bool(answer.get_bool("challenge_by_tutor").unwrap_or(false)),
    ])
}

impl<'a> AnswerStream<'a> {
    /// Stream every transformed answer chunk.
    pub async fn run(&self, user_tests: &IdentifierMap) -> Result<LoadResult> {
        let start = Instant::now();
        let mut result = LoadResult::new(ANSWERS, self.preview);

        let chunks = self.artifacts.chunks(ANSWERS)?;
        if self.artifacts.complete_manifest(ANSWERS).is_none() && !chunks.is_empty() {
            warn!("{}: chunk set has no complete manifest", ANSWERS);
        }
        if user_tests.is_empty() {
            warn!("{}: user test identifier map is empty", ANSWERS);
        }

        let slots = self
            .target
            .slot_ids(&SlotLayout::question_options())
            .await?;
        debug!("Loaded option slots for {} questions", slots.len());

        let columns: Vec<String> = ANSWER_COLUMNS.iter().map(|c| c.to_string()).collect();
        for (index, path) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            let answers = self.artifacts.read_chunk(path)?;
            info!(
                "{}: chunk {}/{} ({} rows)",
                ANSWERS,
                index + 1,
                chunks.len(),
                answers.len()
            );

            let mut batch: Vec<Vec<Value>> = Vec::with_capacity(self.batch_size);
            for answer in &answers {
                match map_answer(answer, user_tests, &slots) {
                    Ok(values) => batch.push(values),
                    Err((reason, detail)) => result.skipped.skip(reason, detail),
                }
                if batch.len() >= self.batch_size {
                    self.flush(&columns, &mut batch, &mut result).await?;
                }
            }
            self.flush(&columns, &mut batch, &mut result).await?;
        }

        result.duration_seconds = start.elapsed().as_secs_f64();
        Ok(result)
    }

    /// Stream one batch. A failed batch is counted as errors and the load
    /// moves on; only fatal errors stop the table.
    async fn flush(
        &self,
        columns: &[String],
        batch: &mut Vec<Vec<Value>>,
        result: &mut LoadResult,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(batch);
        let size = rows.len() as u64;
        match self.target.bulk_stream(ANSWERS, columns, rows).await {
            Ok(written) => {
                result.inserted += written;
                debug!("{}: streamed {} rows", ANSWERS, written);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("{}: batch of {} rows failed: {}", ANSWERS, size, e);
                result.errors.skip_many("batch_failed", size, e.to_string());
                Ok(())
            }
        }
    }
}
