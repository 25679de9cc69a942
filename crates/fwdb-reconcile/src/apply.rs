//! Inclusion mask and the pure planning half of a selective apply.

use std::collections::{BTreeMap, HashSet};

use fwdb_adapters::Batch;
use fwdb_core::{ContactRecord, EmailKey, UpdateMode};
use serde::{Deserialize, Serialize};

use crate::diff::{compute_diff, Diff, DiffEntry};

/// Per-identity include/exclude decisions. Keys without a decision are included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionMask {
    decisions: BTreeMap<EmailKey, bool>,
}

impl InclusionMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every actionable key of `diff`, included.
    pub fn for_diff(diff: &Diff) -> Self {
        Self {
            decisions: diff.actionable_keys().into_iter().map(|k| (k, true)).collect(),
        }
    }

    pub fn is_included(&self, key: &EmailKey) -> bool {
        self.decisions.get(key).copied().unwrap_or(true)
    }

    pub fn set(&mut self, key: EmailKey, included: bool) {
        self.decisions.insert(key, included);
    }

    /// Flip one decision; returns the new state.
    pub fn toggle(&mut self, key: &EmailKey) -> bool {
        let next = !self.is_included(key);
        self.decisions.insert(key.clone(), next);
        next
    }

    pub fn include_all(&mut self, keys: impl IntoIterator<Item = EmailKey>) {
        for key in keys {
            self.decisions.insert(key, true);
        }
    }

    pub fn exclude_all(&mut self, keys: impl IntoIterator<Item = EmailKey>) {
        for key in keys {
            self.decisions.insert(key, false);
        }
    }

    /// Mask for a recomputed diff: prior decisions survive for keys that are
    /// still actionable, new actionable keys start included.
    pub fn carried_over(&self, diff: &Diff) -> Self {
        Self {
            decisions: diff
                .actionable_keys()
                .into_iter()
                .map(|key| {
                    let included = self.is_included(&key);
                    (key, included)
                })
                .collect(),
        }
    }

    pub fn excluded_keys(&self) -> impl Iterator<Item = &EmailKey> {
        self.decisions
            .iter()
            .filter(|(_, included)| !**included)
            .map(|(key, _)| key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ApplyCounts {
    pub updated: usize,
    pub inserted: usize,
    pub kept: usize,
    pub unchanged: usize,
    pub excluded: usize,
    pub duplicates_skipped: usize,
}

/// What an apply will write, computed without touching the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyPlan {
    pub mode: UpdateMode,
    /// Stored rows that survive as they are.
    pub keep: Vec<ContactRecord>,
    /// Batch rows to write.
    pub apply: Vec<ContactRecord>,
    pub counts: ApplyCounts,
    /// Update entries that made it past the mask.
    pub committed_updates: Vec<DiffEntry>,
    pub committed_inserts: Vec<DiffEntry>,
}

impl ApplyPlan {
    /// Table contents after the plan is written.
    pub fn final_rows(&self) -> Vec<ContactRecord> {
        self.keep.iter().chain(&self.apply).cloned().collect()
    }

    pub fn is_noop(&self) -> bool {
        self.apply.is_empty()
    }

    pub fn message(&self) -> String {
        let c = &self.counts;
        match self.mode {
            UpdateMode::Replace => format!(
                "Successfully updated database! Updated: {} rows, Added: {} rows, Kept: {} existing rows.",
                c.updated, c.inserted, c.kept
            ),
            UpdateMode::Append => format!(
                "Successfully appended {} new rows! (Skipped {} duplicate email(s))",
                c.inserted, c.duplicates_skipped
            ),
        }
    }
}

/// Decide which batch rows to commit under `mask`.
///
/// Replace keeps every stored row whose key is not superseded by an applied
/// row, so excluded and unchanged matches stay exactly as stored. Append
/// never touches stored rows.
pub fn plan_apply(batch: &Batch, mode: UpdateMode, stored: &[ContactRecord], mask: &InclusionMask) -> ApplyPlan {
    let diff = compute_diff(batch, mode, stored);
    let (committed_updates, excluded_updates): (Vec<_>, Vec<_>) = diff
        .updates
        .iter()
        .cloned()
        .partition(|entry| mask.is_included(&entry.key));
    let (committed_inserts, excluded_inserts): (Vec<_>, Vec<_>) = diff
        .inserts
        .iter()
        .cloned()
        .partition(|entry| mask.is_included(&entry.key));

    let applied_keys = committed_updates
        .iter()
        .chain(&committed_inserts)
        .map(|entry| entry.key.clone())
        .collect::<HashSet<_>>();
    let apply = batch
        .records()
        .iter()
        .filter(|record| applied_keys.contains(&record.key()))
        .cloned()
        .collect::<Vec<_>>();

    let keep = match mode {
        UpdateMode::Replace => stored
            .iter()
            .filter(|record| !applied_keys.contains(&record.key()))
            .cloned()
            .collect::<Vec<_>>(),
        UpdateMode::Append => stored.to_vec(),
    };

    let counts = ApplyCounts {
        updated: committed_updates.len(),
        inserted: committed_inserts.len(),
        kept: keep.len(),
        unchanged: diff.unchanged.len(),
        excluded: excluded_updates.len() + excluded_inserts.len(),
        duplicates_skipped: diff.duplicates.len(),
    };

    ApplyPlan {
        mode,
        keep,
        apply,
        counts,
        committed_updates,
        committed_inserts,
    }
}
