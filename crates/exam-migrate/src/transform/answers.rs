//! Answer transformation and ordinal resolution.
//!
//! Answers are the largest table, so they are processed chunk by chunk.
//! A first pass collects `(user test, answer id)` pairs to compute the dense
//! `question_order`; a second pass rewrites each raw chunk into size-bounded
//! output chunks. The 1-based ordinal of the chosen option is carried as-is:
//! it only becomes an option id at load time, once the option rows exist.

use super::ordering::dense_order;
use crate::artifacts::{ArtifactStore, ChunkManifest};
use crate::core::{Row, RowExt, SkipLedger};
use crate::error::Result;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

pub const ANSWERS: &str = "user_test_answers";

/// Column holding the unresolved 1-based ordinal in transformed answers.
pub const ORDINAL: &str = "answer_ordinal";

/// Columns streamed into the target answers table, in order.
pub const ANSWER_COLUMNS: [&str; 5] = [
    "user_test_id",
    "question_id",
    "selected_option_id",
    "question_order",
    "challenge_by_tutor",
];

/// Result of resolving an ordinal against a question's option slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// No option chosen.
    Empty,
    Option(i64),
    /// The question has no option rows at all.
    NoOptions,
    /// Positive ordinal beyond the question's option count.
    OutOfRange { ordinal: i64, options: usize },
}

/// Resolve a 1-based ordinal to an option id. Null, zero and negative
/// ordinals mean no selection.
pub fn resolve_selection(ordinal: Option<i64>, slots: Option<&[i64]>) -> Selection {
    let Some(slots) = slots.filter(|s| !s.is_empty()) else {
        return Selection::NoOptions;
    };
    match ordinal {
        None => Selection::Empty,
        Some(n) if n < 1 => Selection::Empty,
        Some(n) if (n as usize) <= slots.len() => Selection::Option(slots[n as usize - 1]),
        Some(n) => Selection::OutOfRange {
            ordinal: n,
            options: slots.len(),
        },
    }
}

/// Target shape of one answer, before the ordinal is resolved.
fn transform_answer(src: &Row, known_questions: &HashSet<i64>) -> std::result::Result<Row, (&'static str, String)> {
    let id = src.get_i64("id");
    let Some(question_id) = src.get_i64("question") else {
        return Err(("missing_question", format!("answer {:?}: no question", id)));
    };
    if !known_questions.contains(&question_id) {
        return Err((
            "unknown_question",
            format!("answer {:?}: question_id {} does not exist", id, question_id),
        ));
    }
    let Some(user_test) = src.get_i64("userTestId") else {
        return Err(("missing_user_test", format!("answer {:?}: no userTestId", id)));
    };

    let mut row = Row::new();
    row.insert("user_test_id".into(), json!(user_test));
    row.insert("question_id".into(), json!(question_id));
    row.insert(ORDINAL.into(), src.value("answer"));
    row.insert(
        "challenge_by_tutor".into(),
        json!(src.get_bool("challenge_by_tutor").unwrap_or(false)),
    );
    row.insert(super::entities::OLD_ID.into(), src.value("id"));
    Ok(row)
}

/// Outcome of the answer transformation.
#[derive(Debug, Clone)]
pub struct AnswerSummary {
    pub rows: u64,
    pub chunks: usize,
    pub skipped: SkipLedger,
}

/// Buffers transformed answers and flushes them as numbered chunks.
struct ChunkWriter<'a> {
    out: &'a ArtifactStore,
    limit: usize,
    buffer: Vec<Row>,
    written: Vec<PathBuf>,
    rows: u64,
}

impl<'a> ChunkWriter<'a> {
    fn push(&mut self, row: Row) -> Result<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.limit {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let index = self.written.len() + 1;
        let path = self.out.write_chunk(ANSWERS, index, &self.buffer)?;
        self.rows += self.buffer.len() as u64;
        self.written.push(path);
        self.buffer.clear();
        Ok(())
    }
}

/// Raw answer sources: the single-file artifact, or else each chunk.
fn raw_sources(raw: &ArtifactStore) -> Result<Vec<Option<PathBuf>>> {
    if raw.table_path(ANSWERS).exists() {
        return Ok(vec![None]);
    }
    Ok(raw.chunks(ANSWERS)?.into_iter().map(Some).collect())
}

fn read_source(raw: &ArtifactStore, source: &Option<PathBuf>) -> Result<Vec<Row>> {
    match source {
        None => raw.read_table_or_empty(ANSWERS),
        Some(path) => raw.read_chunk(path),
    }
}

/// Transform every raw answer chunk into `out`, writing chunks of at most
/// `chunk_rows` rows and a completion manifest.
pub fn transform_answers(
    raw: &ArtifactStore,
    out: &ArtifactStore,
    known_questions: &HashSet<i64>,
    chunk_rows: usize,
    preview: usize,
) -> Result<AnswerSummary> {
    let sources = raw_sources(raw)?;

    // Pass 1: ordering keys of the answers that survive validation.
    let mut pairs: Vec<(i64, i64)> = Vec::new();
    for source in &sources {
        for answer in read_source(raw, source)? {
            let kept = answer
                .get_i64("question")
                .is_some_and(|q| known_questions.contains(&q));
            if let (true, Some(test), Some(id)) =
                (kept, answer.get_i64("userTestId"), answer.get_i64("id"))
            {
                pairs.push((test, id));
            }
        }
    }
    let order: HashMap<i64, i64> = dense_order(pairs);
    debug!("Computed question_order for {} answers", order.len());

    // Pass 2: rewrite.
    out.clear_chunks(ANSWERS)?;
    let mut skipped = SkipLedger::with_preview(preview);
    let mut writer = ChunkWriter {
        out,
        limit: chunk_rows.max(1),
        buffer: Vec::new(),
        written: Vec::new(),
        rows: 0,
    };
    for source in &sources {
        for answer in read_source(raw, source)? {
            match transform_answer(&answer, known_questions) {
                Ok(mut row) => {
                    let position = answer
                        .get_i64("id")
                        .and_then(|id| order.get(&id).copied())
                        .map(Value::from)
                        .unwrap_or(Value::Null);
                    row.insert("question_order".into(), position);
                    writer.push(row)?;
                }
                Err((reason, detail)) => skipped.skip(reason, detail),
            }
        }
    }
    writer.flush()?;

    out.write_manifest(&ChunkManifest {
        table: ANSWERS.to_string(),
        chunks: writer.written.len(),
        rows: writer.rows,
        complete: true,
    })?;
    info!(
        "Transformed {} answers into {} chunks ({} skipped)",
        writer.rows,
        writer.written.len(),
        skipped.total
    );

    Ok(AnswerSummary {
        rows: writer.rows,
        chunks: writer.written.len(),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::row;

    fn answer(id: i64, test: i64, question: i64, ordinal: Value) -> Row {
        row([
            ("id", json!(id)),
            ("userTestId", json!(test)),
            ("question", json!(question)),
            ("answer", ordinal),
        ])
    }

    #[test]
    fn test_resolve_selection() {
        let slots = [101, 102, 103];
        assert_eq!(resolve_selection(Some(2), Some(&slots)), Selection::Option(102));
        assert_eq!(resolve_selection(None, Some(&slots)), Selection::Empty);
        assert_eq!(
            resolve_selection(Some(4), Some(&slots)),
            Selection::OutOfRange { ordinal: 4, options: 3 }
        );
        assert_eq!(resolve_selection(Some(0), Some(&slots)), Selection::Empty);
        assert_eq!(resolve_selection(Some(-2), Some(&slots)), Selection::Empty);
        assert_eq!(resolve_selection(Some(1), None), Selection::NoOptions);
        assert_eq!(resolve_selection(Some(1), Some(&[])), Selection::NoOptions);
    }

    #[test]
    fn test_transform_answers_orders_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let raw = ArtifactStore::new(dir.path().join("raw"));
        let out = ArtifactStore::new(dir.path().join("out"));

        // Two raw chunks with answers for test 55 split across them.
        raw.write_chunk(
            ANSWERS,
            1,
            &[answer(30, 55, 7, json!(2)), answer(11, 56, 7, Value::Null)],
        )
        .unwrap();
        raw.write_chunk(
            ANSWERS,
            2,
            &[answer(12, 55, 8, json!(1)), answer(13, 55, 999, json!(1))],
        )
        .unwrap();

        let known: HashSet<i64> = [7, 8].into_iter().collect();
        let summary = transform_answers(&raw, &out, &known, 2, 5).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.skipped.count("unknown_question"), 1);
        assert_eq!(out.complete_manifest(ANSWERS).unwrap().rows, 3);

        let rows = out.read_all(ANSWERS).unwrap();
        let by_old: HashMap<i64, &Row> = rows
            .iter()
            .map(|r| (r.get_i64("_old_id").unwrap(), r))
            .collect();
        // Test 55 keeps ids 12 and 30; 13 was dropped before ordering.
        assert_eq!(by_old[&12]["question_order"], json!(1));
        assert_eq!(by_old[&30]["question_order"], json!(2));
        assert_eq!(by_old[&11]["question_order"], json!(1));
        assert_eq!(by_old[&11][ORDINAL], Value::Null);
        assert_eq!(by_old[&30][ORDINAL], json!(2));
    }

    #[test]
    fn test_rerun_replaces_previous_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let raw = ArtifactStore::new(dir.path().join("raw"));
        let out = ArtifactStore::new(dir.path().join("out"));
        let known: HashSet<i64> = [7].into_iter().collect();

        let many: Vec<Row> = (1..=5).map(|i| answer(i, 1, 7, json!(1))).collect();
        raw.write_table(ANSWERS, &many).unwrap();
        transform_answers(&raw, &out, &known, 1, 5).unwrap();
        assert_eq!(out.chunks(ANSWERS).unwrap().len(), 5);

        raw.write_table(ANSWERS, &many[..2]).unwrap();
        transform_answers(&raw, &out, &known, 1, 5).unwrap();
        assert_eq!(out.chunks(ANSWERS).unwrap().len(), 2);
    }
}
