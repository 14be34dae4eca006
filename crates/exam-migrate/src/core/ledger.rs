//! Skip accounting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of messages kept for display.
pub const DEFAULT_PREVIEW: usize = 5;

/// Counts skipped records by reason and keeps the first few messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipLedger {
    pub total: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub preview: Vec<String>,
    #[serde(skip, default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_PREVIEW
}

impl Default for SkipLedger {
    fn default() -> Self {
        Self::with_preview(DEFAULT_PREVIEW)
    }
}

impl SkipLedger {
    pub fn with_preview(limit: usize) -> Self {
        Self {
            total: 0,
            by_reason: BTreeMap::new(),
            preview: Vec::new(),
            limit,
        }
    }

    /// Count one skipped record.
    pub fn skip(&mut self, reason: &str, detail: impl Into<String>) {
        self.total += 1;
        *self.by_reason.entry(reason.to_string()).or_insert(0) += 1;
        if self.preview.len() < self.limit {
            self.preview.push(detail.into());
        }
    }

    /// Count `n` records dropped together, with one preview message.
    pub fn skip_many(&mut self, reason: &str, n: u64, detail: impl Into<String>) {
        if n == 0 {
            return;
        }
        self.skip(reason, detail);
        self.total += n - 1;
        *self.by_reason.entry(reason.to_string()).or_insert(0) += n - 1;
    }

    pub fn count(&self, reason: &str) -> u64 {
        self.by_reason.get(reason).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Fold another ledger into this one, respecting this ledger's preview limit.
    pub fn merge(&mut self, other: SkipLedger) {
        self.total += other.total;
        for (reason, n) in other.by_reason {
            *self.by_reason.entry(reason).or_insert(0) += n;
        }
        for msg in other.preview {
            if self.preview.len() >= self.limit {
                break;
            }
            self.preview.push(msg);
        }
    }
}
