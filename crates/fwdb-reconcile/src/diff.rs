//! Set algebra over email keys: what a batch would insert, update or skip.

use std::collections::{HashMap, HashSet};

use fwdb_adapters::Batch;
use fwdb_core::{display_value, Column, ContactRecord, EmailKey, UpdateMode};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub column: Column,
    pub old: String,
    pub new: String,
}

impl FieldChange {
    pub fn display_old(&self) -> &str {
        display_value(&self.old)
    }

    pub fn display_new(&self) -> &str {
        display_value(&self.new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Insert,
    Update,
    Duplicate,
    Unchanged,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Insert => "insert",
            EntryKind::Update => "update",
            EntryKind::Duplicate => "duplicate",
            EntryKind::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub key: EmailKey,
    pub email: String,
    pub name: String,
    pub surname: String,
    /// Field-level changes, in column order. Only updates carry any.
    pub changes: Vec<FieldChange>,
}

impl DiffEntry {
    fn from_record(record: &ContactRecord, changes: Vec<FieldChange>) -> Self {
        Self {
            key: record.key(),
            email: record.display_email(),
            name: record.name.trim().to_string(),
            surname: record.surname.trim().to_string(),
            changes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DiffSummary {
    pub inserts: usize,
    pub updates: usize,
    pub duplicates: usize,
    pub unchanged: usize,
    pub batch_rows: usize,
    pub stored_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub mode: UpdateMode,
    pub inserts: Vec<DiffEntry>,
    pub updates: Vec<DiffEntry>,
    pub duplicates: Vec<DiffEntry>,
    /// Replace-mode matches without a real difference; reported, never applied.
    pub unchanged: Vec<DiffEntry>,
    pub batch_rows: usize,
    pub stored_rows: usize,
}

impl Diff {
    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            inserts: self.inserts.len(),
            updates: self.updates.len(),
            duplicates: self.duplicates.len(),
            unchanged: self.unchanged.len(),
            batch_rows: self.batch_rows,
            stored_rows: self.stored_rows,
        }
    }

    /// Keys a user can include or exclude: updates, then inserts.
    pub fn actionable_keys(&self) -> Vec<EmailKey> {
        self.updates
            .iter()
            .chain(&self.inserts)
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub fn is_actionable(&self, key: &EmailKey) -> bool {
        self.updates.iter().chain(&self.inserts).any(|entry| &entry.key == key)
    }

    pub fn has_actionable(&self) -> bool {
        !self.updates.is_empty() || !self.inserts.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (EntryKind, &DiffEntry)> {
        self.updates
            .iter()
            .map(|e| (EntryKind::Update, e))
            .chain(self.inserts.iter().map(|e| (EntryKind::Insert, e)))
            .chain(self.duplicates.iter().map(|e| (EntryKind::Duplicate, e)))
            .chain(self.unchanged.iter().map(|e| (EntryKind::Unchanged, e)))
    }
}

/// Per-column differences on trimmed values.
pub fn field_changes(stored: &ContactRecord, incoming: &ContactRecord) -> Vec<FieldChange> {
    Column::ALL
        .into_iter()
        .filter_map(|column| {
            let old = column.value(stored).trim();
            let new = column.value(incoming).trim();
            (old != new).then(|| FieldChange {
                column,
                old: old.to_string(),
                new: new.to_string(),
            })
        })
        .collect()
}

/// First stored row per email key, in storage order.
pub(crate) fn first_stored_by_key(stored: &[ContactRecord]) -> HashMap<EmailKey, &ContactRecord> {
    let mut by_key = HashMap::with_capacity(stored.len());
    for record in stored {
        by_key.entry(record.key()).or_insert(record);
    }
    by_key
}

/// Classify every batch record against the stored rows. Pure.
pub fn compute_diff(batch: &Batch, mode: UpdateMode, stored: &[ContactRecord]) -> Diff {
    let stored_by_key = first_stored_by_key(stored);
    let mut diff = Diff {
        mode,
        inserts: Vec::new(),
        updates: Vec::new(),
        duplicates: Vec::new(),
        unchanged: Vec::new(),
        batch_rows: batch.len(),
        stored_rows: stored.len(),
    };

    let mut seen = HashSet::new();
    for record in batch.records() {
        let key = record.key();
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        match (stored_by_key.get(&key), mode) {
            (None, _) => diff.inserts.push(DiffEntry::from_record(record, Vec::new())),
            (Some(_), UpdateMode::Append) => {
                diff.duplicates.push(DiffEntry::from_record(record, Vec::new()))
            }
            (Some(existing), UpdateMode::Replace) => {
                let changes = field_changes(existing, record);
                if changes.is_empty() {
                    diff.unchanged.push(DiffEntry::from_record(record, changes));
                } else {
                    diff.updates.push(DiffEntry::from_record(record, changes));
                }
            }
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwdb_adapters::assemble_batch;

    fn contact(email: &str, name: &str, phone: &str) -> ContactRecord {
        ContactRecord {
            email: email.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_store_turns_every_key_into_an_insert() {
        let batch = assemble_batch(vec![
            contact("a@x.com", "A", ""),
            contact("b@x.com", "B", ""),
            contact("c@x.com", "C", ""),
        ]);
        for mode in [UpdateMode::Replace, UpdateMode::Append] {
            let summary = compute_diff(&batch, mode, &[]).summary();
            assert_eq!((summary.inserts, summary.updates, summary.duplicates), (3, 0, 0));
        }
    }

    #[test]
    fn replace_reports_field_level_changes() {
        let stored = vec![contact("b@x.com", "Bo", "111")];
        let batch = assemble_batch(vec![contact("B@x.com", "Bo ", "222")]);
        let diff = compute_diff(&batch, UpdateMode::Replace, &stored);
        assert_eq!(diff.updates.len(), 1);
        assert!(diff.duplicates.is_empty());
        let changes = &diff.updates[0].changes;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].column, Column::Email);
        assert_eq!(changes[1].column, Column::Phone);
        assert_eq!((changes[1].old.as_str(), changes[1].new.as_str()), ("111", "222"));
    }

    #[test]
    fn blank_values_are_rendered_distinctly() {
        let stored = vec![contact("b@x.com", "", "111")];
        let batch = assemble_batch(vec![contact("b@x.com", "Bo", "")]);
        let diff = compute_diff(&batch, UpdateMode::Replace, &stored);
        let changes = &diff.updates[0].changes;
        assert_eq!(changes[0].display_old(), fwdb_core::EMPTY_MARKER);
        assert_eq!(changes[1].display_new(), fwdb_core::EMPTY_MARKER);
    }

    #[test]
    fn identical_matches_are_unchanged_not_updates() {
        let stored = vec![contact("c@x.com", "C", "1")];
        let batch = assemble_batch(vec![contact(" c@x.com ", " C", "1 ")]);
        let diff = compute_diff(&batch, UpdateMode::Replace, &stored);
        assert!(diff.updates.is_empty());
        assert_eq!(diff.unchanged.len(), 1);
        assert!(!diff.has_actionable());
    }

    #[test]
    fn append_reports_matches_as_duplicates() {
        let stored = vec![contact("c@x.com", "C", "1")];
        let batch = assemble_batch(vec![contact("c@x.com", "Other", "9"), contact("d@x.com", "D", "")]);
        let diff = compute_diff(&batch, UpdateMode::Append, &stored);
        assert!(diff.updates.is_empty());
        assert_eq!(diff.duplicates.len(), 1);
        assert_eq!(diff.inserts.len(), 1);
        assert_eq!(diff.actionable_keys(), vec![EmailKey::from_email("d@x.com")]);
    }

    #[test]
    fn markup_wrapped_stored_emails_key_like_plain_ones() {
        let stored = vec![contact(r#"<a href="mailto:e@x.com">e@x.com</a>"#, "E", "")];
        let batch = assemble_batch(vec![contact("E@X.COM", "E", "")]);
        let diff = compute_diff(&batch, UpdateMode::Append, &stored);
        assert_eq!(diff.duplicates.len(), 1);
        assert_eq!(diff.duplicates[0].email, "E@X.COM");
    }
}
