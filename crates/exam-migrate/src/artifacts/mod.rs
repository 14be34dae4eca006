//! Intermediate artifacts exchanged between stages.
//!
//! Each stage writes its output under a directory as JSON arrays of uniform
//! records. Small tables live in one file (`<table>.json`); large tables are
//! split into numbered chunks (`<table>_001.json`, `<table>_002.json`, ...)
//! plus a manifest that marks the chunk set complete.

use crate::core::Row;
use crate::error::{MigrateError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Completion marker for a chunked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub table: String,
    pub chunks: usize,
    pub rows: u64,
    pub complete: bool,
}

/// Directory of artifacts addressable by table name and chunk index.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{}.json", table))
    }

    /// Path of chunk `index` (1-based).
    pub fn chunk_path(&self, table: &str, index: usize) -> PathBuf {
        self.root.join(format!("{}_{:03}.json", table, index))
    }

    pub fn manifest_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{}.manifest.json", table))
    }

    /// Write any serializable value under `<name>.json`.
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.table_path(name);
        write_atomic(&path, value)?;
        Ok(path)
    }

    /// Read `<name>.json`; `None` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.table_path(name);
        if !path.exists() {
            return Ok(None);
        }
        read_file(&path).map(Some)
    }

    pub fn write_table(&self, table: &str, rows: &[Row]) -> Result<PathBuf> {
        self.write_json(table, rows)
    }

    /// Read a single-file table; `None` when missing, error when corrupt.
    pub fn try_read_table(&self, table: &str) -> Result<Option<Vec<Row>>> {
        self.read_json(table)
    }

    /// Read a single-file table, treating a missing file as empty.
    pub fn read_table_or_empty(&self, table: &str) -> Result<Vec<Row>> {
        Ok(self.try_read_table(table)?.unwrap_or_default())
    }

    pub fn write_chunk(&self, table: &str, index: usize, rows: &[Row]) -> Result<PathBuf> {
        let path = self.chunk_path(table, index);
        write_atomic(&path, rows)?;
        debug!("Wrote {} rows to {:?}", rows.len(), path);
        Ok(path)
    }

    /// Existing chunk files for `table`, ordered by index.
    pub fn chunks(&self, table: &str) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", table);
        let mut found: Vec<(usize, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(digits) = rest.strip_suffix(".json") else {
                continue;
            };
            if digits.len() >= 3 && digits.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(index) = digits.parse() {
                    found.push((index, path));
                }
            }
        }
        found.sort_by_key(|(index, _)| *index);
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    pub fn read_chunk(&self, path: &Path) -> Result<Vec<Row>> {
        read_file(path)
    }

    /// Remove every chunk and the manifest of `table`.
    pub fn clear_chunks(&self, table: &str) -> Result<()> {
        for path in self.chunks(table)? {
            std::fs::remove_file(path)?;
        }
        let manifest = self.manifest_path(table);
        if manifest.exists() {
            std::fs::remove_file(manifest)?;
        }
        Ok(())
    }

    pub fn write_manifest(&self, manifest: &ChunkManifest) -> Result<()> {
        write_atomic(&self.manifest_path(&manifest.table), manifest)
    }

    /// A manifest that is present, parseable and marked complete.
    pub fn complete_manifest(&self, table: &str) -> Option<ChunkManifest> {
        let path = self.manifest_path(table);
        if !path.exists() {
            return None;
        }
        read_file::<ChunkManifest>(&path)
            .ok()
            .filter(|m| m.complete)
    }

    /// All rows of `table`, from the single file or else from its chunks.
    pub fn read_all(&self, table: &str) -> Result<Vec<Row>> {
        if let Some(rows) = self.try_read_table(table)? {
            return Ok(rows);
        }
        let mut rows = Vec::new();
        for path in self.chunks(table)? {
            rows.extend(self.read_chunk(&path)?);
        }
        Ok(rows)
    }

    /// Whether any artifact exists for `table`.
    pub fn has_table(&self, table: &str) -> Result<bool> {
        Ok(self.table_path(table).exists() || !self.chunks(table)?.is_empty())
    }
}

fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| MigrateError::artifact(path, e.to_string()))
}

/// Atomic write: write to temp file, then rename.
fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::row;
    use serde_json::json;

    fn rows(ids: &[i64]) -> Vec<Row> {
        ids.iter().map(|id| row([("id", json!(id))])).collect()
    }

    #[test]
    fn test_table_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.try_read_table("users").unwrap().is_none());
        assert!(store.read_table_or_empty("users").unwrap().is_empty());

        store.write_table("users", &rows(&[1, 2])).unwrap();
        assert_eq!(store.try_read_table("users").unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_table_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::write(store.table_path("topics"), "[{\"id\": 1,").unwrap();
        assert!(matches!(
            store.try_read_table("topics"),
            Err(MigrateError::Artifact { .. })
        ));
    }

    #[test]
    fn test_chunks_are_ordered_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_chunk("user_test_answers", 10, &rows(&[10])).unwrap();
        store.write_chunk("user_test_answers", 2, &rows(&[2])).unwrap();
        store.write_chunk("user_test_answers", 1, &rows(&[1])).unwrap();
        // Neither a chunk nor the manifest
        store.write_table("user_test_answers_extra", &rows(&[99])).unwrap();

        let chunks = store.chunks("user_test_answers").unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].ends_with("user_test_answers_001.json"));
        assert!(chunks[2].ends_with("user_test_answers_010.json"));

        let all = store.read_all("user_test_answers").unwrap();
        let ids: Vec<i64> = all.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 10]);
    }

    #[test]
    fn test_manifest_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_chunk("user_test_answers", 1, &rows(&[1])).unwrap();
        assert!(store.complete_manifest("user_test_answers").is_none());

        store
            .write_manifest(&ChunkManifest {
                table: "user_test_answers".into(),
                chunks: 1,
                rows: 1,
                complete: true,
            })
            .unwrap();
        assert_eq!(store.complete_manifest("user_test_answers").unwrap().rows, 1);

        store.clear_chunks("user_test_answers").unwrap();
        assert!(store.chunks("user_test_answers").unwrap().is_empty());
        assert!(store.complete_manifest("user_test_answers").is_none());
        assert!(!store.has_table("user_test_answers").unwrap());
    }
}
