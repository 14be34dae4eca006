//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    ///
    /// Stage toggles and the force flag are excluded so that re-running a
    /// single stage against the same data does not invalidate the state file.
    pub fn hash(&self) -> String {
        let mut stable = self.clone();
        stable.migration.stages = StageToggles::default();
        stable.migration.force_download = false;
        stable.migration.suspend_triggers = false;
        let yaml = serde_yaml::to_string(&stable).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl StoreConfig {
    /// Same database as `other` (host, port and name).
    pub fn same_database(&self, other: &StoreConfig) -> bool {
        self.host == other.host && self.port == other.port && self.database == other.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source:
  host: old-db.internal
  database: legacy
  user: reader
  password: secret
target:
  host: new-db.internal
  database: platform
  user: writer
  password: secret
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.migration.batch_size, 500);
        assert_eq!(config.migration.target_academy_id, 1);
        assert_eq!(config.extract.partition_rows, 50_000);
        assert_eq!(config.extract.max_retries, 3);
        assert_eq!(config.transform.mock_threshold, 45);
        assert_eq!(config.transform.flashcard_id_offset, 30_000_000);
        assert_eq!(config.load.answer_batch_size, 5_000);
        assert_eq!(config.reconcile.checks.len(), 8);
        assert_eq!(config.reconcile.literal_checks[0].expected, 5);
        assert!(config.migration.stages.any());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.target.database, "platform");
    }

    #[test]
    fn test_hash_ignores_stage_toggles() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let mut toggled = config.clone();
        toggled.migration.stages.extract = false;
        toggled.migration.force_download = true;
        assert_eq!(config.hash(), toggled.hash());

        let mut changed = config.clone();
        changed.migration.target_academy_id = 2;
        assert_ne!(config.hash(), changed.hash());
    }

    #[test]
    fn test_priority_parses_snake_case() {
        let yaml = format!(
            "{}transform:\n  category_priority: [official, psychotechnical, special, study_block, mock]\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.transform.category_priority[0],
            ClassificationRule::Official
        );
    }
}
