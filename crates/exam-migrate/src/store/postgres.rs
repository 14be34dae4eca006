//! PostgreSQL implementations of the store traits.

use super::sql::{self, qualify, quote_ident};
use super::{
    RecomputePass, SlotGeneratingStore, SlotLayout, SourceStore, SslMode, TargetStore, TargetTx,
};
use crate::config::StoreConfig;
use crate::core::Row;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use serde_json::Value;
use std::collections::HashMap;
use tokio_postgres::{Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

/// Rows buffered before each COPY flush.
const COPY_FLUSH_ROWS: usize = 10_000;

/// Build and test a connection pool.
async fn connect_pool(config: &StoreConfig, max_conns: usize, role: &str) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);
    pg_config.application_name("exam-migrate");

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
        Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        None => Manager::from_config(pg_config, NoTls, mgr_config),
    };

    let pool = Pool::builder(mgr)
        .max_size(max_conns)
        .build()
        .map_err(|e| MigrateError::connection(e, format!("creating {} pool", role)))?;

    let client = pool.get().await.map_err(|e| {
        MigrateError::connection(
            e,
            format!(
                "connecting to {} {}:{}/{}",
                role, config.host, config.port, config.database
            ),
        )
    })?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| MigrateError::connection(e, format!("testing {} connection", role)))?;

    info!(
        "Connected to {} PostgreSQL: {}:{}/{}",
        role, config.host, config.port, config.database
    );
    Ok(pool)
}

/// Convert a driver error, surfacing constraint names and dropped connections.
fn db_error(e: tokio_postgres::Error) -> MigrateError {
    if let Some(db) = e.as_db_error() {
        if let Some(constraint) = db.constraint() {
            return MigrateError::ConstraintViolation {
                constraint: constraint.to_string(),
                message: db.message().to_string(),
            };
        }
    }
    if e.is_closed() {
        return MigrateError::connection(e, "connection closed");
    }
    MigrateError::Database(e)
}

async fn get_client(pool: &Pool, context: &str) -> Result<Object> {
    pool.get()
        .await
        .map_err(|e| MigrateError::connection(e, context.to_string()))
}

fn rows_affected(messages: &[SimpleQueryMessage]) -> u64 {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(*n),
            _ => None,
        })
        .sum()
}

fn first_column_i64(messages: &[SimpleQueryMessage]) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    for msg in messages {
        if let SimpleQueryMessage::Row(row) = msg {
            if let Some(text) = row.get(0) {
                let value = text.parse::<i64>().map_err(|_| {
                    MigrateError::Validation(format!("expected integer, got '{}'", text))
                })?;
                out.push(value);
            }
        }
    }
    Ok(out)
}

/// Legacy schema reader.
pub struct PgSource {
    pool: Pool,
    schema: String,
}

impl PgSource {
    pub async fn new(config: &StoreConfig, max_conns: usize) -> Result<Self> {
        let pool = connect_pool(config, max_conns, "source").await?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn select_page(
        &self,
        table: &str,
        order_key: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let client = get_client(&self.pool, "getting source connection").await?;
        let query = format!(
            "SELECT row_to_json(t)::text FROM {} t ORDER BY t.{} LIMIT $1 OFFSET $2",
            qualify(&self.schema, table)?,
            quote_ident(order_key)?
        );
        let rows = client
            .query(&query, &[&(limit as i64), &(offset as i64)])
            .await
            .map_err(db_error)?;

        rows.iter()
            .map(|r| {
                let text: String = r.try_get(0)?;
                match serde_json::from_str::<Value>(&text)? {
                    Value::Object(map) => Ok(map),
                    other => Err(MigrateError::Validation(format!(
                        "{} row is not an object: {}",
                        table, other
                    ))),
                }
            })
            .collect()
    }

    async fn count(&self, table: &str) -> Result<Option<i64>> {
        let client = get_client(&self.pool, "getting source connection").await?;
        let query = format!("SELECT COUNT(*) FROM {}", qualify(&self.schema, table)?);
        match client.query_one(&query, &[]).await {
            Ok(row) => Ok(Some(row.try_get(0)?)),
            Err(e) => {
                warn!("Row count unavailable for source {}: {}", table, e);
                Ok(None)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let client = get_client(&self.pool, "source health check").await?;
        client.simple_query("SELECT 1").await.map_err(db_error)?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

/// Restructured schema writer.
pub struct PgTarget {
    pool: Pool,
    schema: String,
    slot_layouts: Vec<SlotLayout>,
}

impl PgTarget {
    pub async fn new(config: &StoreConfig, max_conns: usize) -> Result<Self> {
        let pool = connect_pool(config, max_conns, "target").await?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
            slot_layouts: vec![SlotLayout::question_options()],
        })
    }
}

impl SlotGeneratingStore for PgTarget {
    fn slot_layout(&self, parent_table: &str) -> Option<SlotLayout> {
        self.slot_layouts
            .iter()
            .find(|l| l.parent_table == parent_table)
            .cloned()
    }
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        let client = get_client(&self.pool, "getting target connection").await?;
        client.batch_execute("BEGIN").await.map_err(db_error)?;
        Ok(Box::new(PgTx {
            client: Some(client),
            schema: self.schema.clone(),
        }))
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let client = get_client(&self.pool, "getting target connection").await?;
        let query = format!("SELECT COUNT(*) FROM {}", qualify(&self.schema, table)?);
        let row = client.query_one(&query, &[]).await.map_err(db_error)?;
        Ok(row.try_get(0)?)
    }

    async fn bulk_stream(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let client = get_client(&self.pool, "getting target connection for COPY").await?;
        let copy_stmt = sql::copy_in(&self.schema, table, columns)?;
        let sink = client.copy_in(&copy_stmt).await.map_err(db_error)?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(1024 * 1024);
        let row_count = rows.len();

        for (i, row) in rows.into_iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    buf.put_u8(b'\t');
                }
                buf.extend_from_slice(sql::copy_text(value).as_bytes());
            }
            buf.put_u8(b'\n');

            if (i + 1) % COPY_FLUSH_ROWS == 0 || i + 1 == row_count {
                sink.send(buf.split().freeze())
                    .await
                    .map_err(|e| MigrateError::load(table, format!("COPY send failed: {}", e)))?;
            }
        }

        let copied = sink.finish().await.map_err(db_error)?;
        debug!("COPY wrote {} rows into {}", copied, table);
        Ok(copied)
    }

    async fn set_trigger(&self, table: &str, trigger: &str, enabled: bool) -> Result<()> {
        let client = get_client(&self.pool, "getting target connection").await?;
        let stmt = sql::set_trigger(&self.schema, table, trigger, enabled)?;
        client.batch_execute(&stmt).await.map_err(db_error)?;
        debug!(
            "{} trigger {} on {}",
            if enabled { "Enabled" } else { "Disabled" },
            trigger,
            table
        );
        Ok(())
    }

    async fn run_pass(&self, pass: &RecomputePass) -> Result<u64> {
        let client = get_client(&self.pool, "getting target connection").await?;
        let affected = client
            .execute(pass.sql.as_str(), &[])
            .await
            .map_err(db_error)?;
        Ok(affected)
    }

    async fn slot_ids(&self, layout: &SlotLayout) -> Result<HashMap<i64, Vec<i64>>> {
        let client = get_client(&self.pool, "getting target connection").await?;
        let parent = quote_ident(&layout.parent_column)?;
        let query = format!(
            "SELECT {parent}::bigint, {}::bigint FROM {} ORDER BY {parent}, {}",
            quote_ident(&layout.id_column)?,
            qualify(&self.schema, &layout.slot_table)?,
            quote_ident(&layout.ordinal_column)?,
        );
        let rows = client.query(&query, &[]).await.map_err(db_error)?;

        let mut slots: HashMap<i64, Vec<i64>> = HashMap::new();
        for row in rows {
            let parent_id: i64 = row.try_get(0)?;
            let slot_id: i64 = row.try_get(1)?;
            slots.entry(parent_id).or_default().push(slot_id);
        }
        Ok(slots)
    }

    async fn reset_sequence(&self, table: &str, column: &str) -> Result<()> {
        let client = get_client(&self.pool, "getting target connection").await?;
        let qualified = qualify(&self.schema, table)?;

        let query = format!(
            "SELECT COALESCE(MAX({})::bigint, 0) FROM {}",
            quote_ident(column)?,
            qualified
        );
        let max_val: i64 = client
            .query_one(&query, &[])
            .await
            .map_err(db_error)?
            .try_get(0)?;
        if max_val == 0 {
            return Ok(());
        }

        client
            .execute(
                "SELECT setval(pg_get_serial_sequence($1, $2), $3)",
                &[&qualified, &column, &max_val],
            )
            .await
            .map_err(db_error)?;
        debug!("Reset sequence for {}.{} to {}", table, column, max_val);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let client = get_client(&self.pool, "target health check").await?;
        client.simple_query("SELECT 1").await.map_err(db_error)?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

/// Transaction pinned to one pooled connection.
///
/// A transaction dropped without commit or rollback detaches its connection
/// from the pool so the open transaction is never reused.
struct PgTx {
    client: Option<Object>,
    schema: String,
}

impl PgTx {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))
    }

    async fn simple(&self, statement: &str) -> Result<Vec<SimpleQueryMessage>> {
        self.client()?
            .simple_query(statement)
            .await
            .map_err(db_error)
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))?;
        client.batch_execute(statement).await.map_err(db_error)
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("Transaction dropped while open; discarding its connection");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl TargetTx for PgTx {
    async fn insert(
        &mut self,
        table: &str,
        row: &Row,
        returning: Option<&str>,
    ) -> Result<Option<i64>> {
        let stmt = sql::insert(&self.schema, table, row, returning)?;
        let messages = self.simple(&stmt).await?;
        if returning.is_none() {
            return Ok(None);
        }
        Ok(first_column_i64(&messages)?.into_iter().next())
    }

    async fn update(&mut self, table: &str, filter: &Row, fields: &Row) -> Result<u64> {
        let stmt = sql::update(&self.schema, table, filter, fields)?;
        let messages = self.simple(&stmt).await?;
        Ok(rows_affected(&messages))
    }

    async fn select_i64(&mut self, table: &str, column: &str, filter: &Row) -> Result<Vec<i64>> {
        let stmt = sql::select_i64(&self.schema, table, column, filter)?;
        let messages = self.simple(&stmt).await?;
        first_column_i64(&messages)
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.simple(&format!("SAVEPOINT {}", quote_ident(name)?))
            .await
            .map(|_| ())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.simple(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)?))
            .await
            .map(|_| ())
    }

    async fn release(&mut self, name: &str) -> Result<()> {
        self.simple(&format!("RELEASE SAVEPOINT {}", quote_ident(name)?))
            .await
            .map(|_| ())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}
