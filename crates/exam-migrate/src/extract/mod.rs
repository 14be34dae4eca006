//! Extractor: paged reads from the source store into resumable artifacts.
//!
//! Small tables are written to one artifact once every page has been read.
//! Tables listed as partitioned are written as numbered chunks of at most
//! `partition_rows` records, followed by a manifest that marks the chunk set
//! complete. A table with a valid artifact (or a complete manifest) is not
//! fetched again unless a forced download is requested.

use crate::artifacts::{ArtifactStore, ChunkManifest};
use crate::config::ExtractConfig;
use crate::core::Row;
use crate::error::{MigrateError, Result};
use crate::store::SourceStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A source table and the key its pages are ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTable {
    pub name: &'static str,
    pub order_key: &'static str,
}

const fn by_id(name: &'static str) -> SourceTable {
    SourceTable {
        name,
        order_key: "id",
    }
}

/// Source tables in extraction order.
pub const SOURCE_TABLES: &[SourceTable] = &[
    by_id("categories"),
    by_id("topics"),
    by_id("questions"),
    by_id("users"),
    by_id("user_tests"),
    by_id("user_test_answers"),
    SourceTable {
        name: "users_favorite_questions",
        order_key: "userId",
    },
    by_id("flash_cards_stack"),
    by_id("flashcards"),
    by_id("academies"),
    by_id("challenges"),
];

/// Look up a catalog entry by name.
pub fn source_table(name: &str) -> Option<SourceTable> {
    SOURCE_TABLES.iter().copied().find(|t| t.name == name)
}

/// Delay before retry `attempt + 1`: `base * 2^attempt` seconds.
fn backoff(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Outcome of extracting one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractSummary {
    pub table: String,
    pub rows: u64,
    pub pages: u64,
    /// Chunk files written (0 for single-file tables).
    pub partitions: usize,
    /// True when an existing artifact was reused.
    pub reused: bool,
    /// Row count reported by the source, when available.
    pub source_count: Option<i64>,
    pub duration_seconds: f64,
}

impl ExtractSummary {
    fn reused(table: &str, rows: u64, partitions: usize) -> Self {
        Self {
            table: table.to_string(),
            rows,
            pages: 0,
            partitions,
            reused: true,
            source_count: None,
            duration_seconds: 0.0,
        }
    }
}

/// Pulls source tables page by page.
pub struct Extractor {
    source: Arc<dyn SourceStore>,
    artifacts: ArtifactStore,
    config: ExtractConfig,
    force: bool,
    cancel: CancellationToken,
}

impl Extractor {
    pub fn new(
        source: Arc<dyn SourceStore>,
        artifacts: ArtifactStore,
        config: ExtractConfig,
        force: bool,
    ) -> Self {
        Self {
            source,
            artifacts,
            config,
            force,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Extract every catalog table in order. Stops at the first failed table.
    pub async fn extract_all(&self) -> Result<Vec<ExtractSummary>> {
        let mut summaries = Vec::with_capacity(SOURCE_TABLES.len());
        for table in SOURCE_TABLES {
            summaries.push(self.extract(*table).await?);
        }
        let total: u64 = summaries.iter().map(|s| s.rows).sum();
        info!("Extraction complete: {} tables, {} rows", summaries.len(), total);
        Ok(summaries)
    }

    /// Extract one table, reusing a previous artifact when allowed.
    pub async fn extract(&self, table: SourceTable) -> Result<ExtractSummary> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        if self.is_partitioned(table.name) {
            self.extract_partitioned(table).await
        } else {
            self.extract_single(table).await
        }
    }

    fn is_partitioned(&self, table: &str) -> bool {
        self.config.partitioned_tables.iter().any(|t| t == table)
    }

    async fn extract_single(&self, table: SourceTable) -> Result<ExtractSummary> {
        if !self.force {
            match self.artifacts.try_read_table(table.name) {
                Ok(Some(rows)) => {
                    info!(
                        "{}: reusing existing artifact ({} rows)",
                        table.name,
                        rows.len()
                    );
                    return Ok(ExtractSummary::reused(table.name, rows.len() as u64, 0));
                }
                Ok(None) => {}
                Err(e) => warn!("{}: existing artifact unreadable, re-extracting: {}", table.name, e),
            }
        }

        let start = Instant::now();
        let source_count = self.source.count(table.name).await?;
        info!(
            "{}: extracting ({} rows reported)",
            table.name,
            source_count.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        );

        let page_size = self.config.page_size;
        let mut rows: Vec<Row> = Vec::new();
        let mut offset = 0u64;
        let mut pages = 0u64;

        loop {
            let page = self.fetch_page(table, offset).await?;
            pages += 1;
            let fetched = page.len();
            rows.extend(page);
            if fetched < page_size {
                break;
            }
            offset += fetched as u64;
        }

        self.artifacts.write_table(table.name, &rows)?;
        let extracted = rows.len() as u64;
        if let Some(expected) = source_count {
            if expected != extracted as i64 {
                warn!(
                    "{}: extracted {} rows but source reported {}",
                    table.name, extracted, expected
                );
            }
        }
        info!("{}: {} rows in {} pages", table.name, extracted, pages);

        Ok(ExtractSummary {
            table: table.name.to_string(),
            rows: extracted,
            pages,
            partitions: 0,
            reused: false,
            source_count,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }

    async fn extract_partitioned(&self, table: SourceTable) -> Result<ExtractSummary> {
        if !self.force {
            if let Some(manifest) = self.artifacts.complete_manifest(table.name) {
                info!(
                    "{}: reusing {} existing partitions ({} rows)",
                    table.name, manifest.chunks, manifest.rows
                );
                return Ok(ExtractSummary::reused(table.name, manifest.rows, manifest.chunks));
            }
        }

        // Partial chunk sets are never resumed mid-table.
        self.artifacts.clear_chunks(table.name)?;

        let start = Instant::now();
        let page_size = self.config.page_size;
        let partition_rows = self.config.partition_rows;
        let tolerance = self.config.empty_page_tolerance;

        let mut buffer: Vec<Row> = Vec::with_capacity(partition_rows);
        let mut chunk = 0usize;
        let mut total = 0u64;
        let mut offset = 0u64;
        let mut pages = 0u64;
        let mut empty_streak = 0u32;

        info!(
            "{}: extracting into partitions of {} rows",
            table.name, partition_rows
        );

        loop {
            let page = self.fetch_page(table, offset).await?;
            pages += 1;

            if page.is_empty() {
                empty_streak += 1;
                debug!(
                    "{}: empty page at offset {} ({}/{})",
                    table.name, offset, empty_streak, tolerance
                );
                if empty_streak >= tolerance {
                    break;
                }
                offset += page_size as u64;
                continue;
            }
            empty_streak = 0;

            let fetched = page.len();
            offset += fetched as u64;
            total += fetched as u64;
            buffer.extend(page);

            while buffer.len() >= partition_rows {
                let rest = buffer.split_off(partition_rows);
                chunk += 1;
                self.artifacts.write_chunk(table.name, chunk, &buffer)?;
                buffer = rest;
            }

            if fetched < page_size {
                break;
            }
        }

        if !buffer.is_empty() {
            chunk += 1;
            self.artifacts.write_chunk(table.name, chunk, &buffer)?;
        }

        self.artifacts.write_manifest(&ChunkManifest {
            table: table.name.to_string(),
            chunks: chunk,
            rows: total,
            complete: true,
        })?;
        info!(
            "{}: {} rows in {} partitions ({} pages)",
            table.name, total, chunk, pages
        );

        Ok(ExtractSummary {
            table: table.name.to_string(),
            rows: total,
            pages,
            partitions: chunk,
            reused: false,
            source_count: None,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }

    /// Fetch one page, retrying with an exponentially growing delay.
    async fn fetch_page(&self, table: SourceTable, offset: u64) -> Result<Vec<Row>> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            match self
                .source
                .select_page(table.name, table.order_key, offset, self.config.page_size)
                .await
            {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 == attempts {
                        break;
                    }
                    let wait = backoff(self.config.retry_backoff_secs, attempt);
                    warn!(
                        "{}: page at offset {} failed (attempt {}/{}), retrying in {:?}: {}",
                        table.name,
                        offset,
                        attempt + 1,
                        attempts,
                        wait,
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        Err(MigrateError::PageFetch {
            table: table.name.to_string(),
            offset,
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::row;
    use crate::store::MemorySource;
    use serde_json::json;

    fn rows(n: i64) -> Vec<Row> {
        (1..=n).map(|id| row([("id", json!(id))])).collect()
    }

    fn config(page_size: usize, partition_rows: usize) -> ExtractConfig {
        ExtractConfig {
            page_size,
            partition_rows,
            retry_backoff_secs: 0,
            ..ExtractConfig::default()
        }
    }

    fn extractor(source: MemorySource, dir: &std::path::Path, cfg: ExtractConfig, force: bool) -> Extractor {
        Extractor::new(Arc::new(source), ArtifactStore::new(dir), cfg, force)
    }

    #[tokio::test]
    async fn test_full_extraction_matches_source_count() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_table("questions", rows(7));
        let ex = extractor(source, dir.path(), config(3, 100), true);

        let summary = ex.extract(source_table("questions").unwrap()).await.unwrap();
        assert_eq!(summary.rows, 7);
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.source_count, Some(7));
        let written = ArtifactStore::new(dir.path()).read_all("questions").unwrap();
        assert_eq!(written.len(), 7);
    }

    #[tokio::test]
    async fn test_existing_artifact_is_reused_without_force() {
        let dir = tempfile::tempdir().unwrap();
        ArtifactStore::new(dir.path()).write_table("users", &rows(2)).unwrap();

        let source = Arc::new(MemorySource::new().with_table("users", rows(5)));
        let ex = Extractor::new(source.clone(), ArtifactStore::new(dir.path()), config(10, 100), false);
        let summary = ex.extract(source_table("users").unwrap()).await.unwrap();
        assert!(summary.reused);
        assert_eq!(summary.rows, 2);
        assert_eq!(source.page_requests(), 0);

        let forced = Extractor::new(source.clone(), ArtifactStore::new(dir.path()), config(10, 100), true);
        assert_eq!(forced.extract(source_table("users").unwrap()).await.unwrap().rows, 5);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_reextracted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::write(store.table_path("topics"), "[{").unwrap();

        let source = MemorySource::new().with_table("topics", rows(4));
        let summary = extractor(source, dir.path(), config(10, 100), false)
            .extract(source_table("topics").unwrap())
            .await
            .unwrap();
        assert!(!summary.reused);
        assert_eq!(store.read_all("topics").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_page_failure_retried_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new()
            .with_table("categories", rows(4))
            .fail_page("categories", 2, 2);
        let summary = extractor(source, dir.path(), config(2, 100), true)
            .extract(source_table("categories").unwrap())
            .await
            .unwrap();
        assert_eq!(summary.rows, 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_name_table_and_offset() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new()
            .with_table("categories", rows(4))
            .fail_page("categories", 2, 3);
        let err = extractor(source, dir.path(), config(2, 100), true)
            .extract(source_table("categories").unwrap())
            .await
            .unwrap_err();
        match err {
            MigrateError::PageFetch { table, offset, .. } => {
                assert_eq!(table, "categories");
                assert_eq!(offset, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ArtifactStore::new(dir.path()).has_table("categories").unwrap());
    }

    #[test]
    fn test_backoff_doubles() {
        let waits: Vec<u64> = (0..4).map(|a| backoff(5, a).as_secs()).collect();
        assert_eq!(waits, vec![5, 10, 20, 40]);
        // saturates instead of overflowing
        assert_eq!(backoff(5, 80), Duration::from_secs(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new()
            .with_table("users", rows(1))
            .fail_page("users", 0, 3);
        let cfg = ExtractConfig {
            page_size: 10,
            retry_backoff_secs: 5,
            max_retries: 4,
            ..ExtractConfig::default()
        };
        let started = tokio::time::Instant::now();
        extractor(source, dir.path(), cfg, true)
            .extract(source_table("users").unwrap())
            .await
            .unwrap();
        // 5s, 10s, then 20s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(35));
        assert!(elapsed < Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_partitioned_extraction_writes_chunks_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_table("user_test_answers", rows(7));
        let summary = extractor(source, dir.path(), config(2, 3), true)
            .extract(source_table("user_test_answers").unwrap())
            .await
            .unwrap();
        assert_eq!(summary.rows, 7);
        assert_eq!(summary.partitions, 3);

        let store = ArtifactStore::new(dir.path());
        let chunks = store.chunks("user_test_answers").unwrap();
        assert!(chunks[0].ends_with("user_test_answers_001.json"));
        assert_eq!(store.read_chunk(&chunks[2]).unwrap().len(), 1);
        assert_eq!(store.complete_manifest("user_test_answers").unwrap().rows, 7);
    }

    #[tokio::test]
    async fn test_partitioned_stops_after_empty_page_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::new().with_table("user_test_answers", rows(4)));
        let ex = Extractor::new(source.clone(), ArtifactStore::new(dir.path()), config(2, 10), true);
        let summary = ex.extract(source_table("user_test_answers").unwrap()).await.unwrap();
        assert_eq!(summary.rows, 4);
        // two full pages, then five empty ones
        assert_eq!(source.page_requests(), 7);

        // a complete manifest short-circuits the next run
        let again = Extractor::new(source.clone(), ArtifactStore::new(dir.path()), config(2, 10), false);
        assert!(again.extract(source_table("user_test_answers").unwrap()).await.unwrap().reused);
        assert_eq!(source.page_requests(), 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extractor(MemorySource::new(), dir.path(), config(2, 10), true)
            .with_cancel(cancel)
            .extract(source_table("users").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
    }

    #[test]
    fn test_favorites_ordered_by_user() {
        assert_eq!(source_table("users_favorite_questions").unwrap().order_key, "userId");
        assert_eq!(SOURCE_TABLES.len(), 11);
    }
}
