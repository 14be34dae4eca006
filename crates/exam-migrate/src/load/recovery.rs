//! Constraint recovery policies.
//!
//! A failed insert is classified by the name of the violated constraint and
//! mapped to one recovery action. Adding a constraint means adding a row to
//! [`RecoveryPolicy::exam_defaults`], not touching the load loop.

use crate::core::{Row, RowExt};
use crate::error::MigrateError;
use serde_json::Value;
use std::collections::HashMap;

/// What to do when an insert violates a known constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the insert once with `column` set to null.
    RetryWithFieldCleared { column: String },
    /// Retry the insert once with `column` suffixed by `-{id}`.
    RetryWithIdSuffix { column: String },
    /// The record already exists: update its non-null fields matched by `key`.
    FallbackUpdate { key: String },
    /// Drop the record and count it under `reason`.
    Skip { reason: String },
}

/// Mapping from constraint name to recovery action.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    rules: HashMap<String, RecoveryAction>,
}

impl RecoveryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, constraint: &str, action: RecoveryAction) -> Self {
        self.rules.insert(constraint.to_string(), action);
        self
    }

    /// Policies for the exam platform target schema.
    pub fn exam_defaults() -> Self {
        let skip = |reason: &str| RecoveryAction::Skip {
            reason: reason.to_string(),
        };
        Self::new()
            .with(
                "users_username_key",
                RecoveryAction::FallbackUpdate {
                    key: "username".to_string(),
                },
            )
            .with(
                "academies_pkey",
                RecoveryAction::FallbackUpdate {
                    key: "id".to_string(),
                },
            )
            .with(
                "academies_slug_key",
                RecoveryAction::RetryWithIdSuffix {
                    column: "slug".to_string(),
                },
            )
            .with(
                "challenge_tutor_uuid_fkey",
                RecoveryAction::RetryWithFieldCleared {
                    column: "tutor_uuid".to_string(),
                },
            )
            .with("challenge_user_id_fkey", skip("missing_user"))
            .with("challenge_question_id_fkey", skip("missing_question"))
            .with("challenge_topic_id_fkey", skip("missing_topic"))
            .with("user_tests_user_id_fkey", skip("missing_user"))
            .with("user_favorite_questions_user_id_fkey", skip("missing_user"))
            .with(
                "user_favorite_questions_question_id_fkey",
                skip("missing_question"),
            )
    }

    /// Action for an error, when it names a constraint with a policy.
    pub fn action_for(&self, err: &MigrateError) -> Option<&RecoveryAction> {
        self.rules.get(err.constraint()?)
    }
}

/// `row` with `column` set to null.
pub fn clear_field(row: &Row, column: &str) -> Row {
    let mut retry = row.clone();
    retry.insert(column.to_string(), Value::Null);
    retry
}

/// `row` with `column` rewritten to `{value}-{id}`. `None` without an id.
pub fn suffix_with_id(row: &Row, column: &str) -> Option<Row> {
    let id = row.get_i64("id")?;
    let base = row.get_str(column).unwrap_or_default();
    let mut retry = row.clone();
    retry.insert(column.to_string(), Value::from(format!("{}-{}", base, id)));
    Some(retry)
}

/// Filter and non-null update fields for a fallback update keyed by `key`.
///
/// The key and the primary key are never part of the update.
pub fn fallback_update(row: &Row, key: &str) -> Option<(Row, Row)> {
    let key_value = row.field(key)?.clone();
    let mut filter = Row::new();
    filter.insert(key.to_string(), key_value);
    let fields: Row = row
        .iter()
        .filter(|(col, val)| col.as_str() != key && col.as_str() != "id" && !val.is_null())
        .map(|(col, val)| (col.clone(), val.clone()))
        .collect();
    if fields.is_empty() {
        return None;
    }
    Some((filter, fields))
}
