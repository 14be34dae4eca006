//! Core data types shared by every stage.
//!
//! - [`record`]: the `Row` record type and typed field access
//! - [`idmap`]: the append-only source id to target id map
//! - [`ledger`]: skip/error accounting with a bounded message preview

pub mod idmap;
pub mod ledger;
pub mod record;

pub use idmap::IdentifierMap;
pub use ledger::SkipLedger;
pub use record::{Row, RowExt};
