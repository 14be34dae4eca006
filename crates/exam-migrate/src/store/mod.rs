//! Source and target store boundaries.
//!
//! The stages only talk to the databases through these traits:
//!
//! - [`SourceStore`]: paged reads from the legacy schema
//! - [`TargetStore`]: transactions, bulk streaming, trigger control and
//!   recompute passes against the restructured schema
//! - [`TargetTx`]: one open transaction with savepoints
//! - [`SlotGeneratingStore`]: the capability of generating dependent rows
//!   (option slots) when a parent row is inserted
//!
//! [`postgres`] implements them over deadpool-postgres, [`memory`] keeps
//! everything in process for dry runs and tests.

pub mod memory;
pub mod postgres;
pub mod sql;
mod tls;

pub use memory::{MemorySource, MemoryTarget};
pub use postgres::{PgSource, PgTarget};
pub use tls::SslMode;

use crate::core::Row;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Paged read access to the source schema.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Rows `[offset, offset + limit)` of `table` ordered by `order_key`.
    async fn select_page(
        &self,
        table: &str,
        order_key: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Row count, or `None` when the store cannot produce one.
    async fn count(&self, table: &str) -> Result<Option<i64>>;

    /// Round trip to the store.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Store type name for logging.
    fn db_type(&self) -> &str;
}

/// Where the dependent rows of a parent table live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub parent_table: String,
    pub slot_table: String,
    /// Column in the slot table referencing the parent id.
    pub parent_column: String,
    /// Column in the slot table holding the 1-based ordinal.
    pub ordinal_column: String,
    /// Primary key of the slot table.
    pub id_column: String,
}

impl SlotLayout {
    /// Option slots generated for every inserted question.
    pub fn question_options() -> Self {
        Self {
            parent_table: "questions".to_string(),
            slot_table: "question_options".to_string(),
            parent_column: "question_id".to_string(),
            ordinal_column: "option_order".to_string(),
            id_column: "id".to_string(),
        }
    }

    /// Filter selecting one slot.
    pub fn slot_filter(&self, key: SlotKey) -> Row {
        let mut filter = Row::new();
        filter.insert(self.parent_column.clone(), Value::from(key.parent_id));
        filter.insert(self.ordinal_column.clone(), Value::from(key.ordinal));
        filter
    }

    /// Filter selecting every slot of a parent.
    pub fn parent_filter(&self, parent_id: i64) -> Row {
        let mut filter = Row::new();
        filter.insert(self.parent_column.clone(), Value::from(parent_id));
        filter
    }
}

/// Deterministic key of a dependent row: parent id plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub parent_id: i64,
    pub ordinal: i64,
}

/// Stores that generate dependent rows when a parent is inserted.
pub trait SlotGeneratingStore {
    /// Layout of the rows generated for inserts into `parent_table`.
    fn slot_layout(&self, parent_table: &str) -> Option<SlotLayout>;
}

/// A set-based statement run once after a bulk load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputePass {
    pub name: String,
    pub sql: String,
}

/// Marks scored user tests finalized.
pub const PASS_FINALIZE_USER_TESTS: &str = "finalize_user_tests";
/// Recomputes answer correctness from the selected option.
pub const PASS_ANSWER_CORRECTNESS: &str = "answer_correctness";

/// One open target transaction.
#[async_trait]
pub trait TargetTx: Send {
    /// Insert `row`; returns the value of `returning` when requested.
    async fn insert(&mut self, table: &str, row: &Row, returning: Option<&str>)
        -> Result<Option<i64>>;

    /// Update rows matching every `filter` pair; returns rows affected.
    async fn update(&mut self, table: &str, filter: &Row, fields: &Row) -> Result<u64>;

    /// Integer column values of rows matching `filter`, ascending.
    async fn select_i64(&mut self, table: &str, column: &str, filter: &Row) -> Result<Vec<i64>>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to(&mut self, name: &str) -> Result<()>;
    async fn release(&mut self, name: &str) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Insert a parent row and return the keys of the slots the store
    /// generated for it.
    async fn insert_with_slots(&mut self, layout: &SlotLayout, row: &Row) -> Result<Vec<SlotKey>> {
        let parent_id = self
            .insert(&layout.parent_table, row, Some("id"))
            .await?
            .ok_or_else(|| {
                MigrateError::Validation(format!(
                    "insert into {} returned no id",
                    layout.parent_table
                ))
            })?;
        let ordinals = self
            .select_i64(
                &layout.slot_table,
                &layout.ordinal_column,
                &layout.parent_filter(parent_id),
            )
            .await?;
        Ok(ordinals
            .into_iter()
            .map(|ordinal| SlotKey { parent_id, ordinal })
            .collect())
    }

    /// Fill an existing slot. Never inserts; returns rows affected.
    async fn fill_slot(&mut self, layout: &SlotLayout, key: SlotKey, fields: &Row) -> Result<u64> {
        self.update(&layout.slot_table, &layout.slot_filter(key), fields)
            .await
    }
}

/// Write access to the target schema.
#[async_trait]
pub trait TargetStore: SlotGeneratingStore + Send + Sync {
    async fn begin(&self) -> Result<Box<dyn TargetTx>>;

    async fn count(&self, table: &str) -> Result<i64>;

    /// Stream uniform rows with the bulk protocol; returns rows written.
    async fn bulk_stream(&self, table: &str, columns: &[String], rows: Vec<Vec<Value>>)
        -> Result<u64>;

    async fn set_trigger(&self, table: &str, trigger: &str, enabled: bool) -> Result<()>;

    /// Run a recompute pass; returns rows affected.
    async fn run_pass(&self, pass: &RecomputePass) -> Result<u64>;

    /// Slot ids per parent, ordered by ordinal.
    async fn slot_ids(&self, layout: &SlotLayout) -> Result<HashMap<i64, Vec<i64>>>;

    /// Move the id sequence of `table` past its largest `column` value.
    async fn reset_sequence(&self, table: &str, column: &str) -> Result<()>;

    /// Round trip to the store.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Store type name for logging.
    fn db_type(&self) -> &str;
}
