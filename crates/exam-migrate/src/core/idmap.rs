//! Source id to persisted target id mapping.

use crate::error::{MigrateError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Append-only mapping from a source table's ids to the ids the target
/// store assigned when those records were inserted.
///
/// Persisted as a flat JSON object keyed by the stringified source id,
/// e.g. `{"55": 1203}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierMap {
    source_table: String,
    entries: HashMap<i64, i64>,
}

impl IdentifierMap {
    pub fn new(source_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            entries: HashMap::new(),
        }
    }

    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `old -> new`.
    ///
    /// Re-recording the same pair is a no-op. Remapping an id to a different
    /// target id is refused: entries are never overwritten.
    pub fn record(&mut self, old: i64, new: i64) -> Result<()> {
        match self.entries.get(&old) {
            Some(existing) if *existing == new => Ok(()),
            Some(existing) => Err(MigrateError::State(format!(
                "{} id {} already mapped to {}, refusing remap to {}",
                self.source_table, old, existing, new
            ))),
            None => {
                self.entries.insert(old, new);
                Ok(())
            }
        }
    }

    pub fn get(&self, old: i64) -> Option<i64> {
        self.entries.get(&old).copied()
    }

    /// Resolve `old`, producing a `MappingMiss` when absent.
    pub fn resolve(&self, old: i64) -> Result<i64> {
        self.get(old).ok_or_else(|| MigrateError::MappingMiss {
            table: self.source_table.clone(),
            source_id: old.to_string(),
        })
    }

    /// Load a persisted map. A missing file yields an empty map.
    pub fn load<P: AsRef<Path>>(source_table: &str, path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut map = Self::new(source_table);
        if !path.exists() {
            return Ok(map);
        }

        let content = std::fs::read_to_string(path)?;
        let raw: BTreeMap<String, i64> = serde_json::from_str(&content)
            .map_err(|e| MigrateError::artifact(path, format!("invalid id map: {}", e)))?;
        for (key, new) in raw {
            let old: i64 = key.parse().map_err(|_| {
                MigrateError::artifact(path, format!("non-numeric source id '{}'", key))
            })?;
            map.record(old, new)?;
        }
        Ok(map)
    }

    /// Persist the map (atomic write).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let raw: BTreeMap<String, i64> = self
            .entries
            .iter()
            .map(|(old, new)| (old.to_string(), *new))
            .collect();
        let content = serde_json::to_string_pretty(&raw)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}
