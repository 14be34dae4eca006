//! In-process stores.
//!
//! `MemoryTarget` reproduces the target behaviors the load stage depends on:
//! serial ids with PostgreSQL sequence semantics, primary/unique/foreign key
//! constraints reported by name, a slot-generating insert trigger,
//! transactions with savepoints, trigger enable flags and the named
//! recompute passes.

use super::{
    RecomputePass, SlotGeneratingStore, SlotLayout, SourceStore, TargetStore, TargetTx,
    PASS_ANSWER_CORRECTNESS, PASS_FINALIZE_USER_TESTS,
};
use crate::core::{Row, RowExt};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(col, val)| match val {
        Value::Null => row.field(col).is_none(),
        _ => row.get(col) == Some(val),
    })
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Source store backed by in-memory tables.
#[derive(Default)]
pub struct MemorySource {
    tables: HashMap<String, Vec<Row>>,
    page_failures: Mutex<HashMap<(String, u64), u32>>,
    uncounted: HashSet<String>,
    requests: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.tables.insert(table.to_string(), rows);
        self
    }

    /// Fail the page of `table` starting at `offset` the next `times` requests.
    pub fn fail_page(self, table: &str, offset: u64, times: u32) -> Self {
        lock(&self.page_failures).insert((table.to_string(), offset), times);
        self
    }

    /// Make `count(table)` report no count.
    pub fn without_count(mut self, table: &str) -> Self {
        self.uncounted.insert(table.to_string());
        self
    }

    /// Number of `select_page` calls served so far.
    pub fn page_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn select_page(
        &self,
        table: &str,
        order_key: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if let Some(remaining) = lock(&self.page_failures).get_mut(&(table.to_string(), offset)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrateError::connection(
                    "simulated page failure",
                    format!("{} offset {}", table, offset),
                ));
            }
        }

        let Some(rows) = self.tables.get(table) else {
            return Err(MigrateError::Validation(format!(
                "relation \"{}\" does not exist",
                table
            )));
        };
        let mut sorted: Vec<&Row> = rows.iter().collect();
        sorted.sort_by_key(|r| r.get_i64(order_key));

        Ok(sorted
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, table: &str) -> Result<Option<i64>> {
        if self.uncounted.contains(table) {
            return Ok(None);
        }
        Ok(self.tables.get(table).map(|rows| rows.len() as i64))
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Tables of a `MemoryTarget`, by name.
pub type MemoryTables = BTreeMap<String, Vec<Row>>;

/// Number of slots generated for an inserted parent row.
pub type SlotCountFn = Arc<dyn Fn(&MemoryTables, &Row) -> usize + Send + Sync>;

#[derive(Debug, Clone)]
struct UniqueKey {
    name: String,
    table: String,
    columns: Vec<String>,
}

#[derive(Debug, Clone)]
struct ForeignKey {
    name: String,
    table: String,
    column: String,
    parent_table: String,
    parent_column: String,
}

#[derive(Clone)]
struct SlotRule {
    layout: SlotLayout,
    count: SlotCountFn,
}

#[derive(Clone, Default)]
struct Schema {
    unique: Vec<UniqueKey>,
    foreign: Vec<ForeignKey>,
    slot_rules: Vec<SlotRule>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: MemoryTables,
    /// Last value handed out per table; explicit ids do not advance it.
    sequences: HashMap<String, i64>,
}

impl Snapshot {
    fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn check(&self, schema: &Schema, table: &str, row: &Row, skip: Option<usize>) -> Result<()> {
        let others = || {
            self.rows(table)
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, r)| r)
        };

        if let Some(id) = row.field("id") {
            if others().any(|r| r.get("id") == Some(id)) {
                return Err(violation(
                    &format!("{}_pkey", table),
                    format!("duplicate key value (id)=({})", id),
                ));
            }
        }

        for key in schema.unique.iter().filter(|k| k.table == table) {
            let values: Option<Vec<&Value>> = key.columns.iter().map(|c| row.field(c)).collect();
            let Some(values) = values else { continue };
            let clash = others().any(|r| {
                key.columns
                    .iter()
                    .zip(&values)
                    .all(|(c, v)| r.get(c) == Some(*v))
            });
            if clash {
                return Err(violation(
                    &key.name,
                    format!("duplicate key value violates unique constraint \"{}\"", key.name),
                ));
            }
        }

        for fk in schema.foreign.iter().filter(|k| k.table == table) {
            let Some(value) = row.field(&fk.column) else {
                continue;
            };
            let present = self
                .rows(&fk.parent_table)
                .iter()
                .any(|p| p.get(&fk.parent_column) == Some(value));
            if !present {
                return Err(violation(
                    &fk.name,
                    format!(
                        "Key ({})=({}) is not present in table \"{}\"",
                        fk.column, value, fk.parent_table
                    ),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, schema: &Schema, table: &str, row: &Row) -> Result<Row> {
        let mut stored = row.clone();
        if stored.field("id").is_none() {
            let next = self.sequences.entry(table.to_string()).or_insert(0);
            *next += 1;
            stored.insert("id".to_string(), Value::from(*next));
        }
        self.check(schema, table, &stored, None)?;
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(stored.clone());

        let parent_id = stored.get_i64("id");
        for rule in schema.slot_rules.iter().filter(|r| r.layout.parent_table == table) {
            let (Some(parent_id), count) = (parent_id, (rule.count)(&self.tables, &stored)) else {
                continue;
            };
            for ordinal in 1..=count as i64 {
                let mut slot = Row::new();
                slot.insert(rule.layout.parent_column.clone(), Value::from(parent_id));
                slot.insert(rule.layout.ordinal_column.clone(), Value::from(ordinal));
                slot.insert("answer".to_string(), Value::from(""));
                slot.insert("is_correct".to_string(), Value::Bool(false));
                self.insert(schema, &rule.layout.slot_table, &slot)?;
            }
        }
        Ok(stored)
    }

    fn update(&mut self, schema: &Schema, table: &str, filter: &Row, fields: &Row) -> Result<u64> {
        let targets: Vec<usize> = self
            .rows(table)
            .iter()
            .enumerate()
            .filter(|(_, r)| matches(r, filter))
            .map(|(i, _)| i)
            .collect();

        for &i in &targets {
            let mut updated = self.rows(table)[i].clone();
            for (col, val) in fields {
                updated.insert(col.clone(), val.clone());
            }
            self.check(schema, table, &updated, Some(i))?;
            if let Some(rows) = self.tables.get_mut(table) {
                rows[i] = updated;
            }
        }
        Ok(targets.len() as u64)
    }
}

fn violation(constraint: &str, message: String) -> MigrateError {
    MigrateError::ConstraintViolation {
        constraint: constraint.to_string(),
        message,
    }
}

/// Target store backed by in-memory tables.
pub struct MemoryTarget {
    schema: Arc<Schema>,
    state: Arc<Mutex<Snapshot>>,
    triggers: Mutex<BTreeMap<(String, String), bool>>,
    trigger_log: Mutex<Vec<(String, String, bool)>>,
    passes: Mutex<Vec<String>>,
    failing_bulk: HashSet<String>,
    failing_counts: HashSet<String>,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    /// Empty store with no constraints.
    pub fn new() -> Self {
        Self {
            schema: Arc::new(Schema::default()),
            state: Arc::new(Mutex::new(Snapshot::default())),
            triggers: Mutex::new(BTreeMap::new()),
            trigger_log: Mutex::new(Vec::new()),
            passes: Mutex::new(Vec::new()),
            failing_bulk: HashSet::new(),
            failing_counts: HashSet::new(),
        }
    }

    /// Store shaped like the exam platform target schema.
    pub fn exam_schema() -> Self {
        let fks = [
            ("categories_topic_type_fkey", "categories", "topic_type", "topic_type", "id"),
            ("topic_topic_type_id_fkey", "topic", "topic_type_id", "topic_type", "id"),
            ("topic_category_id_fkey", "topic", "category_id", "categories", "id"),
            ("questions_topic_fkey", "questions", "topic", "topic", "id"),
            ("question_options_question_id_fkey", "question_options", "question_id", "questions", "id"),
            ("user_tests_user_id_fkey", "user_tests", "user_id", "users", "id"),
            ("user_test_answers_user_test_id_fkey", "user_test_answers", "user_test_id", "user_tests", "id"),
            ("user_test_answers_question_id_fkey", "user_test_answers", "question_id", "questions", "id"),
            ("user_favorite_questions_user_id_fkey", "user_favorite_questions", "user_id", "users", "id"),
            ("user_favorite_questions_question_id_fkey", "user_favorite_questions", "question_id", "questions", "id"),
            ("challenge_user_id_fkey", "challenge", "user_id", "users", "id"),
            ("challenge_question_id_fkey", "challenge", "question_id", "questions", "id"),
            ("challenge_topic_id_fkey", "challenge", "topic_id", "topic", "id"),
            ("challenge_tutor_uuid_fkey", "challenge", "tutor_uuid", "cms_users", "user_uuid"),
        ];

        let mut target = Self::new()
            .with_unique("users_username_key", "users", &["username"])
            .with_unique("academies_slug_key", "academies", &["slug"]);
        for (name, table, column, parent_table, parent_column) in fks {
            target = target.with_foreign_key(name, table, column, parent_table, parent_column);
        }

        // Blank options per question, as many as its topic declares.
        target.with_slot_rule(SlotLayout::question_options(), |tables, question| {
            let topic_id = question.field("topic");
            tables
                .get("topic")
                .and_then(|topics| topics.iter().find(|t| t.field("id") == topic_id))
                .and_then(|t| t.get_i64("options"))
                .map(|n| n.max(0) as usize)
                .unwrap_or(4)
        })
    }

    fn schema_mut(&mut self) -> &mut Schema {
        Arc::make_mut(&mut self.schema)
    }

    pub fn with_unique(mut self, name: &str, table: &str, columns: &[&str]) -> Self {
        self.schema_mut().unique.push(UniqueKey {
            name: name.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn with_foreign_key(
        mut self,
        name: &str,
        table: &str,
        column: &str,
        parent_table: &str,
        parent_column: &str,
    ) -> Self {
        self.schema_mut().foreign.push(ForeignKey {
            name: name.to_string(),
            table: table.to_string(),
            column: column.to_string(),
            parent_table: parent_table.to_string(),
            parent_column: parent_column.to_string(),
        });
        self
    }

    pub fn with_slot_rule<F>(mut self, layout: SlotLayout, count: F) -> Self
    where
        F: Fn(&MemoryTables, &Row) -> usize + Send + Sync + 'static,
    {
        self.schema_mut().slot_rules.push(SlotRule {
            layout,
            count: Arc::new(count),
        });
        self
    }

    /// Seed rows without constraint checks or slot generation.
    pub fn with_rows(self, table: &str, rows: Vec<Row>) -> Self {
        {
            let mut state = lock(&self.state);
            let max_id = rows.iter().filter_map(|r| r.get_i64("id")).max().unwrap_or(0);
            let seq = state.sequences.entry(table.to_string()).or_insert(0);
            *seq = (*seq).max(max_id);
            state.tables.entry(table.to_string()).or_default().extend(rows);
        }
        self
    }

    /// Make every `bulk_stream` into `table` fail.
    pub fn fail_bulk(mut self, table: &str) -> Self {
        self.failing_bulk.insert(table.to_string());
        self
    }

    /// Make `count(table)` fail.
    pub fn fail_count(mut self, table: &str) -> Self {
        self.failing_counts.insert(table.to_string());
        self
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.state).rows(table).to_vec()
    }

    /// Current state of a trigger; triggers start enabled.
    pub fn trigger_enabled(&self, table: &str, trigger: &str) -> bool {
        lock(&self.triggers)
            .get(&(table.to_string(), trigger.to_string()))
            .copied()
            .unwrap_or(true)
    }

    /// Every trigger change, in order.
    pub fn trigger_log(&self) -> Vec<(String, String, bool)> {
        lock(&self.trigger_log).clone()
    }

    /// Names of the recompute passes run, in order.
    pub fn passes(&self) -> Vec<String> {
        lock(&self.passes).clone()
    }

    fn finalize_user_tests(state: &mut Snapshot) -> u64 {
        let mut affected = 0;
        if let Some(tests) = state.tables.get_mut("user_tests") {
            for test in tests.iter_mut().filter(|t| t.field("score").is_some()) {
                test.insert("finalized".to_string(), Value::Bool(true));
                affected += 1;
            }
        }
        affected
    }

    fn answer_correctness(state: &mut Snapshot) -> u64 {
        let correct_options: HashSet<i64> = state
            .rows("question_options")
            .iter()
            .filter(|o| o.get_bool("is_correct") == Some(true))
            .filter_map(|o| o.get_i64("id"))
            .collect();

        let mut affected = 0;
        if let Some(answers) = state.tables.get_mut("user_test_answers") {
            for answer in answers.iter_mut() {
                let correct = answer
                    .get_i64("selected_option_id")
                    .map(|id| correct_options.contains(&id))
                    .unwrap_or(false);
                if answer.get_bool("correct") != Some(correct) {
                    answer.insert("correct".to_string(), Value::Bool(correct));
                    affected += 1;
                }
            }
        }
        affected
    }
}

impl SlotGeneratingStore for MemoryTarget {
    fn slot_layout(&self, parent_table: &str) -> Option<SlotLayout> {
        self.schema
            .slot_rules
            .iter()
            .find(|r| r.layout.parent_table == parent_table)
            .map(|r| r.layout.clone())
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        let working = lock(&self.state).clone();
        Ok(Box::new(MemoryTx {
            schema: Arc::clone(&self.schema),
            shared: Arc::clone(&self.state),
            working,
            savepoints: Vec::new(),
        }))
    }

    async fn count(&self, table: &str) -> Result<i64> {
        if self.failing_counts.contains(table) {
            return Err(MigrateError::Validation(format!(
                "relation \"{}\" does not exist",
                table
            )));
        }
        Ok(lock(&self.state).rows(table).len() as i64)
    }

    async fn bulk_stream(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        if self.failing_bulk.contains(table) {
            return Err(MigrateError::load(table, "simulated COPY failure"));
        }

        // COPY is all-or-nothing: stage into a copy of the state.
        let mut staged = lock(&self.state).clone();
        let mut written = 0;
        for values in rows {
            if values.len() != columns.len() {
                return Err(MigrateError::load(
                    table,
                    format!("expected {} columns, got {}", columns.len(), values.len()),
                ));
            }
            let record: Row = columns.iter().cloned().zip(values).collect();
            staged.insert(&self.schema, table, &record)?;
            written += 1;
        }
        *lock(&self.state) = staged;
        Ok(written)
    }

    async fn set_trigger(&self, table: &str, trigger: &str, enabled: bool) -> Result<()> {
        lock(&self.triggers).insert((table.to_string(), trigger.to_string()), enabled);
        lock(&self.trigger_log).push((table.to_string(), trigger.to_string(), enabled));
        Ok(())
    }

    async fn run_pass(&self, pass: &RecomputePass) -> Result<u64> {
        lock(&self.passes).push(pass.name.clone());
        let mut state = lock(&self.state);
        let affected = match pass.name.as_str() {
            PASS_FINALIZE_USER_TESTS => Self::finalize_user_tests(&mut state),
            PASS_ANSWER_CORRECTNESS => Self::answer_correctness(&mut state),
            other => {
                debug!("No simulation for pass {}", other);
                0
            }
        };
        Ok(affected)
    }

    async fn slot_ids(&self, layout: &SlotLayout) -> Result<HashMap<i64, Vec<i64>>> {
        let state = lock(&self.state);
        let mut keyed: BTreeMap<i64, BTreeSet<(i64, i64)>> = BTreeMap::new();
        for slot in state.rows(&layout.slot_table) {
            let (Some(parent), Some(ordinal), Some(id)) = (
                slot.get_i64(&layout.parent_column),
                slot.get_i64(&layout.ordinal_column),
                slot.get_i64(&layout.id_column),
            ) else {
                continue;
            };
            keyed.entry(parent).or_default().insert((ordinal, id));
        }
        Ok(keyed
            .into_iter()
            .map(|(parent, slots)| (parent, slots.into_iter().map(|(_, id)| id).collect()))
            .collect())
    }

    async fn reset_sequence(&self, table: &str, column: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let max_val = state
            .rows(table)
            .iter()
            .filter_map(|r| r.get_i64(column))
            .max()
            .unwrap_or(0);
        if max_val > 0 {
            state.sequences.insert(table.to_string(), max_val);
        }
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

/// Transaction over a private copy of the committed state.
struct MemoryTx {
    schema: Arc<Schema>,
    shared: Arc<Mutex<Snapshot>>,
    working: Snapshot,
    savepoints: Vec<(String, Snapshot)>,
}

#[async_trait]
impl TargetTx for MemoryTx {
    async fn insert(
        &mut self,
        table: &str,
        row: &Row,
        returning: Option<&str>,
    ) -> Result<Option<i64>> {
        let stored = self.working.insert(&self.schema, table, row)?;
        Ok(returning.and_then(|col| stored.get_i64(col)))
    }

    async fn update(&mut self, table: &str, filter: &Row, fields: &Row) -> Result<u64> {
        if filter.is_empty() || fields.is_empty() {
            return Err(MigrateError::Validation(format!(
                "update of {} needs a filter and fields",
                table
            )));
        }
        self.working.update(&self.schema, table, filter, fields)
    }

    async fn select_i64(&mut self, table: &str, column: &str, filter: &Row) -> Result<Vec<i64>> {
        let mut values: Vec<i64> = self
            .working
            .rows(table)
            .iter()
            .filter(|r| matches(r, filter))
            .filter_map(|r| r.get_i64(column))
            .collect();
        values.sort_unstable();
        Ok(values)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| MigrateError::State(format!("savepoint \"{}\" does not exist", name)))?;
        self.savepoints.truncate(pos + 1);
        self.working = self.savepoints[pos].1.clone();
        Ok(())
    }

    async fn release(&mut self, name: &str) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| MigrateError::State(format!("savepoint \"{}\" does not exist", name)))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = *self;
        *lock(&tx.shared) = tx.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
