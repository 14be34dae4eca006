//! Configuration validation.

use super::{Config, StoreConfig};
use crate::error::{MigrateError, Result};
use std::collections::HashSet;

fn validate_store(prefix: &str, store: &StoreConfig) -> Result<()> {
    if store.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", prefix)));
    }
    if store.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.database is required",
            prefix
        )));
    }
    if store.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", prefix)));
    }
    crate::store::SslMode::parse(&store.ssl_mode)?;
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_store("source", &config.source)?;
    validate_store("target", &config.target)?;

    // Cannot migrate into the database we read from
    if config.source.same_database(&config.target) {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let m = &config.migration;
    if m.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if m.max_connections == 0 {
        return Err(MigrateError::Config(
            "migration.max_connections must be at least 1".into(),
        ));
    }
    if !m.stages.any() {
        return Err(MigrateError::Config(
            "migration.stages must enable at least one stage".into(),
        ));
    }

    let e = &config.extract;
    if e.page_size == 0 || e.partition_rows == 0 {
        return Err(MigrateError::Config(
            "extract.page_size and extract.partition_rows must be at least 1".into(),
        ));
    }
    if e.partition_rows < e.page_size {
        return Err(MigrateError::Config(format!(
            "extract.partition_rows ({}) must not be smaller than extract.page_size ({})",
            e.partition_rows, e.page_size
        )));
    }
    if e.max_retries == 0 {
        return Err(MigrateError::Config(
            "extract.max_retries must be at least 1".into(),
        ));
    }

    let t = &config.transform;
    if t.flashcard_id_offset <= 0 {
        return Err(MigrateError::Config(
            "transform.flashcard_id_offset must be positive".into(),
        ));
    }
    if t.answer_chunk_rows == 0 {
        return Err(MigrateError::Config(
            "transform.answer_chunk_rows must be at least 1".into(),
        ));
    }
    let unique: HashSet<_> = t.category_priority.iter().collect();
    if t.category_priority.is_empty() || unique.len() != t.category_priority.len() {
        return Err(MigrateError::Config(
            "transform.category_priority must list each rule at most once".into(),
        ));
    }

    let l = &config.load;
    if l.question_commit_interval == 0
        || l.user_commit_interval == 0
        || l.user_test_batch_size == 0
        || l.answer_batch_size == 0
    {
        return Err(MigrateError::Config(
            "load batch sizes and commit intervals must be at least 1".into(),
        ));
    }

    let r = &config.reconcile;
    if !(r.tolerance > 0.0 && r.tolerance < 1.0) {
        return Err(MigrateError::Config(format!(
            "reconcile.tolerance must be in (0, 1), got {}",
            r.tolerance
        )));
    }
    if let Some(bad) = r.checks.iter().find(|c| c.ratio <= 0.0) {
        return Err(MigrateError::Config(format!(
            "reconcile check {} -> {} must have a positive ratio",
            bad.source, bad.target
        )));
    }
    if let Some(bad) = r.literal_checks.iter().find(|c| c.expected < 0) {
        return Err(MigrateError::Config(format!(
            "reconcile literal check {} must expect a non-negative count",
            bad.target
        )));
    }

    Ok(())
}
