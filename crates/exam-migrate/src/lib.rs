//! # exam-migrate
//!
//! Staged migration engine for exam-platform data, from the legacy schema
//! into the restructured one. Four stages run in order, each leaving a
//! durable artifact for the next:
//!
//! - **Extractor**: paged, resumable reads from the source store
//! - **Transformer**: classification, dense ordering and per-entity policies
//! - **Load Orchestrator**: dependency-ordered loads with identifier capture,
//!   option slot filling, constraint recovery and trigger suspension
//! - **Reconciler**: read-only row count checks with expected ratios
//!
//! ## Example
//!
//! ```rust,no_run
//! use exam_migrate::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> exam_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pipeline = Pipeline::connect(config).await?;
//!     let result = pipeline.run().await?;
//!     println!("Loaded {} rows", result.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod core;
pub mod error;
pub mod extract;
pub mod load;
pub mod orchestrator;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod transform;

// Re-exports for convenient access
pub use artifacts::ArtifactStore;
pub use config::Config;
pub use core::{IdentifierMap, Row, RowExt, SkipLedger};
pub use error::{MigrateError, Result};
pub use extract::{ExtractSummary, Extractor};
pub use load::{LoadOrchestrator, LoadReport, LoadResult, TableStatus};
pub use orchestrator::{HealthCheckResult, MigrationResult, Pipeline};
pub use reconcile::{CheckStatus, ReconciliationReport, ReconciliationResult, Reconciler};
pub use state::{RunContext, RunState, Stage};
pub use store::{MemorySource, MemoryTarget, SourceStore, TargetStore};
pub use transform::{TransformSummary, Transformer};
