//! Contact table persistence + upload storage for FWDB.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fwdb_core::{ContactRecord, EmailKey};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;
mod upload;

pub use sqlite::{SqliteContactStore, DEFAULT_DATABASE_URL};
pub use upload::{StoredUpload, UploadStore};

pub const CRATE_NAME: &str = "fwdb-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening database {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Point operations that could not be applied to exactly one row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no stored row matches the given values")]
    NoMatch,
    #[error("{matches} identical rows match '{key}'; edit them by email instead")]
    Ambiguous { matches: usize, key: EmailKey },
    #[error("email '{0}' already belongs to another row")]
    KeyTaken(EmailKey),
    #[error("email must not be empty")]
    EmptyEmail,
}

/// Storage contract for the single contact table.
///
/// Existence is tracked by the store itself: `table_exists` never goes back to
/// the backend, and every write creates the table when needed.
#[async_trait]
pub trait ContactStore: Send + Sync {
    fn table_exists(&self) -> bool;

    async fn row_count(&self) -> Result<usize, StoreError>;

    /// Every stored row in storage order; empty when the table is absent.
    async fn load_all(&self) -> Result<Vec<ContactRecord>, StoreError>;

    /// Atomically swap the table contents for `rows`.
    async fn replace_all(&self, rows: &[ContactRecord]) -> Result<(), StoreError>;

    /// Atomically add `rows` after the existing ones.
    async fn append(&self, rows: &[ContactRecord]) -> Result<(), StoreError>;

    /// Returns `false` when there was nothing to drop.
    async fn drop_table(&self) -> Result<bool, StoreError>;

    async fn update_row(&self, before: &ContactRecord, after: &ContactRecord) -> Result<(), StoreError>;

    async fn delete_row(&self, row: &ContactRecord) -> Result<(), StoreError>;

    /// Replace every row holding `key` with a single `after` row.
    async fn update_by_key(&self, key: &EmailKey, after: &ContactRecord) -> Result<usize, StoreError>;

    async fn delete_by_key(&self, key: &EmailKey) -> Result<usize, StoreError>;
}

/// Locate the one row whose six columns equal `target` exactly.
pub(crate) fn single_match<I: Copy>(
    rows: &[(I, ContactRecord)],
    target: &ContactRecord,
) -> Result<I, ValidationError> {
    let mut hits = rows.iter().filter(|(_, row)| row == target);
    let Some((id, _)) = hits.next() else {
        return Err(ValidationError::NoMatch);
    };
    let extra = hits.count();
    if extra > 0 {
        return Err(ValidationError::Ambiguous {
            matches: extra + 1,
            key: target.key(),
        });
    }
    Ok(*id)
}

/// Reject moving rows onto an email key held by a row outside `moving`.
/// Edits that keep `current` as the key are never rejected here.
pub(crate) fn ensure_key_free<I: PartialEq>(
    rows: &[(I, ContactRecord)],
    moving: &[I],
    current: &EmailKey,
    after: &ContactRecord,
) -> Result<(), ValidationError> {
    let key = after.key();
    if &key == current {
        return Ok(());
    }
    if key.is_empty() {
        return Err(ValidationError::EmptyEmail);
    }
    let taken = rows
        .iter()
        .any(|(id, row)| !moving.contains(id) && row.key() == key);
    if taken {
        Err(ValidationError::KeyTaken(key))
    } else {
        Ok(())
    }
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryContactStore {
    rows: Arc<RwLock<Option<Vec<ContactRecord>>>>,
    exists: Arc<AtomicBool>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already holds a table with `rows`.
    pub fn with_rows(rows: Vec<ContactRecord>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(Some(rows))),
            exists: Arc::new(AtomicBool::new(true)),
        }
    }

    fn indexed(rows: &[ContactRecord]) -> Vec<(usize, ContactRecord)> {
        rows.iter().cloned().enumerate().collect()
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    fn table_exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    async fn row_count(&self) -> Result<usize, StoreError> {
        Ok(self.rows.read().await.as_ref().map_or(0, Vec::len))
    }

    async fn load_all(&self) -> Result<Vec<ContactRecord>, StoreError> {
        Ok(self.rows.read().await.clone().unwrap_or_default())
    }

    async fn replace_all(&self, rows: &[ContactRecord]) -> Result<(), StoreError> {
        *self.rows.write().await = Some(rows.to_vec());
        self.exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, rows: &[ContactRecord]) -> Result<(), StoreError> {
        self.rows
            .write()
            .await
            .get_or_insert_with(Vec::new)
            .extend_from_slice(rows);
        self.exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_table(&self) -> Result<bool, StoreError> {
        let existed = self.rows.write().await.take().is_some();
        self.exists.store(false, Ordering::SeqCst);
        Ok(existed)
    }

    async fn update_row(&self, before: &ContactRecord, after: &ContactRecord) -> Result<(), StoreError> {
        let mut guard = self.rows.write().await;
        let rows = guard.as_mut().ok_or(ValidationError::NoMatch)?;
        let indexed = Self::indexed(rows);
        let idx = single_match(&indexed, before)?;
        ensure_key_free(&indexed, &[idx], &before.key(), after)?;
        rows[idx] = after.clone();
        Ok(())
    }

    async fn delete_row(&self, row: &ContactRecord) -> Result<(), StoreError> {
        let mut guard = self.rows.write().await;
        let rows = guard.as_mut().ok_or(ValidationError::NoMatch)?;
        let idx = single_match(&Self::indexed(rows), row)?;
        rows.remove(idx);
        Ok(())
    }

    async fn update_by_key(&self, key: &EmailKey, after: &ContactRecord) -> Result<usize, StoreError> {
        let mut guard = self.rows.write().await;
        let rows = guard.as_mut().ok_or(ValidationError::NoMatch)?;
        let indexed = Self::indexed(rows);
        let moving = indexed
            .iter()
            .filter(|(_, row)| &row.key() == key)
            .map(|(idx, _)| *idx)
            .collect::<Vec<_>>();
        let Some(&first) = moving.first() else {
            return Err(ValidationError::NoMatch.into());
        };
        ensure_key_free(&indexed, &moving, key, after)?;
        rows[first] = after.clone();
        let mut position = 0;
        rows.retain(|_| {
            let keep = position == first || !moving.contains(&position);
            position += 1;
            keep
        });
        Ok(moving.len())
    }

    async fn delete_by_key(&self, key: &EmailKey) -> Result<usize, StoreError> {
        let mut guard = self.rows.write().await;
        let rows = guard.as_mut().ok_or(ValidationError::NoMatch)?;
        let before = rows.len();
        rows.retain(|row| &row.key() != key);
        let removed = before - rows.len();
        if removed == 0 {
            return Err(ValidationError::NoMatch.into());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(email: &str, name: &str) -> ContactRecord {
        ContactRecord {
            email: email.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn absent_table_reads_as_empty() {
        let store = MemoryContactStore::new();
        assert!(!store.table_exists());
        assert_eq!(store.row_count().await.unwrap(), 0);
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(!store.drop_table().await.unwrap());
    }

    #[tokio::test]
    async fn append_creates_the_table_and_replace_swaps_contents() {
        let store = MemoryContactStore::new();
        store.append(&[contact("a@x.com", "A")]).await.unwrap();
        assert!(store.table_exists());
        store
            .replace_all(&[contact("b@x.com", "B"), contact("c@x.com", "C")])
            .await
            .unwrap();
        let names = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["B", "C"]);
        assert!(store.drop_table().await.unwrap());
        assert!(!store.table_exists());
    }

    #[tokio::test]
    async fn point_update_and_delete_by_full_row() {
        let store = MemoryContactStore::with_rows(vec![contact("a@x.com", "A"), contact("b@x.com", "B")]);
        store
            .update_row(&contact("a@x.com", "A"), &contact("a@x.com", "Ann"))
            .await
            .unwrap();
        store.delete_row(&contact("b@x.com", "B")).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), vec![contact("a@x.com", "Ann")]);

        let err = store.delete_row(&contact("b@x.com", "B")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::NoMatch)));
    }

    #[tokio::test]
    async fn identical_rows_are_ambiguous_for_point_ops() {
        let twin = contact("a@x.com", "A");
        let store = MemoryContactStore::with_rows(vec![twin.clone(), twin.clone()]);
        let err = store.delete_row(&twin).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::Ambiguous { matches: 2, .. })
        ));
        assert_eq!(store.row_count().await.unwrap(), 2);

        let merged = store
            .update_by_key(&twin.key(), &contact("a@x.com", "Merged"))
            .await
            .unwrap();
        assert_eq!(merged, 2);
        assert_eq!(store.load_all().await.unwrap(), vec![contact("a@x.com", "Merged")]);
    }

    #[tokio::test]
    async fn update_refuses_to_take_another_rows_email() {
        let store = MemoryContactStore::with_rows(vec![contact("a@x.com", "A"), contact("b@x.com", "B")]);
        let err = store
            .update_row(&contact("a@x.com", "A"), &contact("B@X.com", "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::KeyTaken(_))));
    }

    #[tokio::test]
    async fn edits_that_keep_the_email_ignore_rows_sharing_it() {
        let first = contact("a@x.com", "One");
        let second = contact("a@x.com", "Two");
        let store = MemoryContactStore::with_rows(vec![first.clone(), second.clone()]);
        store
            .update_row(&first, &contact("a@x.com", "Nine"))
            .await
            .unwrap();

        let blank = contact("", "Legacy");
        store.append(&[blank.clone()]).await.unwrap();
        store.update_row(&blank, &contact("  ", "Renamed")).await.unwrap();

        assert_eq!(
            store.load_all().await.unwrap(),
            vec![contact("a@x.com", "Nine"), second, contact("  ", "Renamed")]
        );

        let err = store
            .update_row(&contact("  ", "Renamed"), &contact("a@x.com", "Renamed"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::KeyTaken(_))));
    }

    #[tokio::test]
    async fn delete_by_key_removes_every_row_with_that_email() {
        let store = MemoryContactStore::with_rows(vec![
            contact("a@x.com", "A"),
            contact(" A@X.COM", "A2"),
            contact("b@x.com", "B"),
        ]);
        let removed = store.delete_by_key(&EmailKey::from_email("a@x.com")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.row_count().await.unwrap(), 1);
    }
}
