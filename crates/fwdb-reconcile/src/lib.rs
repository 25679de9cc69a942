//! Contact reconciliation: diff, selective apply, sessions, exports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fwdb_adapters::{AdapterError, Batch, Ingested, ReadError, SchemaError};
use fwdb_core::{ContactRecord, EmailKey, UpdateMode};
use fwdb_storage::{ContactStore, SqliteContactStore, StoreError, ValidationError, DEFAULT_DATABASE_URL};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub mod apply;
pub mod diff;
pub mod export;
pub mod session;

pub use apply::{plan_apply, ApplyCounts, ApplyPlan, InclusionMask};
pub use diff::{compute_diff, field_changes, Diff, DiffEntry, DiffSummary, EntryKind, FieldChange};
pub use export::{
    export_diff_csv, export_filename, export_table_csv, write_table_snapshot, SnapshotFile,
    SnapshotManifest,
};
pub use session::{ReconcileSession, SessionSlot, UploadIdentity};

pub const CRATE_NAME: &str = "fwdb-reconcile";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub database_url: String,
    pub uploads_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub web_port: u16,
    pub snapshot_before_drop: bool,
    pub workspace_root: PathBuf,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            uploads_dir: std::env::var("FWDB_UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./uploads")),
            reports_dir: std::env::var("FWDB_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            web_port: std::env::var("FWDB_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            snapshot_before_drop: std::env::var("FWDB_SNAPSHOT_BEFORE_DROP")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Config rooted in `dir`, for tests and throwaway runs.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_url: format!("sqlite://{}", dir.join("fw_data_base.db").display()),
            uploads_dir: dir.join("uploads"),
            reports_dir: dir.join("reports"),
            web_port: 8000,
            snapshot_before_drop: true,
            workspace_root: dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no reconciliation in progress; upload a file first")]
    NoSession,
    #[error(transparent)]
    Export(#[from] anyhow::Error),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(v) => ReconcileError::Validation(v),
            other => ReconcileError::Store(other),
        }
    }
}

impl From<AdapterError> for ReconcileError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Read(e) => ReconcileError::Read(e),
            AdapterError::Schema(e) => ReconcileError::Schema(e),
        }
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub mode: UpdateMode,
    pub counts: ApplyCounts,
    pub message: String,
    pub committed_updates: Vec<DiffEntry>,
    pub committed_inserts: Vec<DiffEntry>,
    /// `false` when nothing was selected and the store was left alone.
    pub wrote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub exists: bool,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DropReport {
    pub existed: bool,
    pub rows_removed: usize,
    pub snapshot: Option<SnapshotManifest>,
}

/// Entry point for every store-touching reconciliation operation.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ContactStore>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ContactStore>, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Connect the SQLite store named by `config.database_url`.
    pub async fn connect(config: ReconcileConfig) -> Result<Self> {
        let store = SqliteContactStore::connect(&config.database_url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn stats(&self) -> Result<TableStats> {
        Ok(TableStats {
            exists: self.store.table_exists(),
            row_count: self.store.row_count().await?,
        })
    }

    /// Read-only diff of `batch` against the current table.
    pub async fn preview(&self, batch: &Batch, mode: UpdateMode) -> Result<Diff> {
        let stored = self.store.load_all().await?;
        Ok(compute_diff(batch, mode, &stored))
    }

    pub async fn start_session(
        &self,
        upload: UploadIdentity,
        stored_path: PathBuf,
        ingested: Ingested,
        mode: UpdateMode,
    ) -> Result<ReconcileSession> {
        let stored = self.store.load_all().await?;
        Ok(ReconcileSession::new(
            upload,
            stored_path,
            ingested.batch,
            ingested.report,
            mode,
            &stored,
        ))
    }

    pub async fn set_mode(&self, session: &mut ReconcileSession, mode: UpdateMode) -> Result<()> {
        let stored = self.store.load_all().await?;
        session.set_mode(mode, &stored);
        Ok(())
    }

    pub async fn refresh(&self, session: &mut ReconcileSession) -> Result<()> {
        let stored = self.store.load_all().await?;
        session.refresh(&stored);
        Ok(())
    }

    /// Commit the included part of `batch` with a single store write.
    pub async fn apply(&self, batch: &Batch, mode: UpdateMode, mask: &InclusionMask) -> Result<ApplyReport> {
        let span = info_span!("apply", %mode, batch = batch.len());
        async {
            let stored = self.store.load_all().await?;
            let plan = plan_apply(batch, mode, &stored, mask);
            self.write_plan(plan).await
        }
        .instrument(span)
        .await
    }

    pub async fn apply_session(&self, session: &ReconcileSession) -> Result<ApplyReport> {
        self.apply(&session.batch, session.mode(), session.mask()).await
    }

    async fn write_plan(&self, plan: ApplyPlan) -> Result<ApplyReport> {
        let wrote = !plan.is_noop();
        if wrote {
            match plan.mode {
                UpdateMode::Replace => self.store.replace_all(&plan.final_rows()).await?,
                UpdateMode::Append => self.store.append(&plan.apply).await?,
            }
        }
        let counts = plan.counts;
        info!(
            updated = counts.updated,
            inserted = counts.inserted,
            kept = counts.kept,
            excluded = counts.excluded,
            duplicates_skipped = counts.duplicates_skipped,
            wrote,
            "apply finished"
        );
        Ok(ApplyReport {
            mode: plan.mode,
            counts,
            message: if wrote {
                plan.message()
            } else {
                "No changes selected; the table was left untouched.".to_string()
            },
            committed_updates: plan.committed_updates,
            committed_inserts: plan.committed_inserts,
            wrote,
        })
    }

    pub async fn load_rows(&self) -> Result<Vec<ContactRecord>> {
        Ok(self.store.load_all().await?)
    }

    /// Case-insensitive substring search across all six columns.
    pub async fn search(&self, query: &str) -> Result<Vec<ContactRecord>> {
        let rows = self.store.load_all().await?;
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .filter(|row| row.values().iter().any(|v| v.to_lowercase().contains(&needle)))
            .collect())
    }

    pub async fn update_row(&self, before: &ContactRecord, after: &ContactRecord) -> Result<()> {
        self.store.update_row(before, after).await?;
        info!(key = %before.key(), "row updated");
        Ok(())
    }

    pub async fn delete_row(&self, row: &ContactRecord) -> Result<()> {
        self.store.delete_row(row).await?;
        info!(key = %row.key(), "row deleted");
        Ok(())
    }

    pub async fn update_by_key(&self, key: &EmailKey, after: &ContactRecord) -> Result<usize> {
        Ok(self.store.update_by_key(key, after).await?)
    }

    pub async fn delete_by_key(&self, key: &EmailKey) -> Result<usize> {
        let removed = self.store.delete_by_key(key).await?;
        info!(%key, removed, "rows deleted by email");
        Ok(removed)
    }

    pub async fn export_table_csv(&self) -> Result<Vec<u8>> {
        let rows = self.store.load_all().await?;
        Ok(export_table_csv(&rows)?)
    }

    /// Parquet snapshot of the current table; `None` when there is no table.
    pub async fn snapshot(&self) -> Result<Option<SnapshotManifest>> {
        if !self.store.table_exists() {
            return Ok(None);
        }
        let rows = self.store.load_all().await?;
        Ok(Some(write_table_snapshot(&self.config.reports_dir, &rows, Utc::now())?))
    }

    /// Irreversible. Callers are responsible for the confirmation step.
    pub async fn drop_table(&self) -> Result<DropReport> {
        let rows_removed = self.store.row_count().await?;
        let snapshot = if self.config.snapshot_before_drop {
            self.snapshot().await?
        } else {
            None
        };
        let existed = self.store.drop_table().await?;
        info!(existed, rows_removed, "contact table dropped");
        Ok(DropReport {
            existed,
            rows_removed,
            snapshot,
        })
    }
}

/// Open a spreadsheet and normalize the selected sheets into a batch.
pub fn ingest_file(path: &Path, sheets: &[String]) -> Result<Ingested> {
    Ok(fwdb_adapters::ingest_path(path, sheets)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwdb_adapters::assemble_batch;
    use fwdb_storage::MemoryContactStore;
    use tempfile::tempdir;

    fn contact(email: &str, name: &str, phone: &str) -> ContactRecord {
        ContactRecord {
            email: email.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            ..Default::default()
        }
    }

    fn reconciler(store: MemoryContactStore, dir: &Path) -> Reconciler {
        Reconciler::new(Arc::new(store), ReconcileConfig::in_dir(dir))
    }

    #[tokio::test]
    async fn apply_into_empty_store_creates_the_table() {
        let dir = tempdir().expect("tempdir");
        let rec = reconciler(MemoryContactStore::new(), dir.path());
        let batch = assemble_batch(vec![
            contact("a@x.com", "A", ""),
            contact("b@x.com", "B", ""),
            contact("c@x.com", "C", ""),
        ]);
        let report = rec
            .apply(&batch, UpdateMode::Replace, &InclusionMask::new())
            .await
            .unwrap();
        assert!(report.wrote);
        assert_eq!((report.counts.inserted, report.counts.updated, report.counts.kept), (3, 0, 0));
        assert_eq!(rec.stats().await.unwrap(), TableStats { exists: true, row_count: 3 });
    }

    #[tokio::test]
    async fn nothing_selected_leaves_an_absent_table_absent() {
        let dir = tempdir().expect("tempdir");
        let rec = reconciler(MemoryContactStore::new(), dir.path());
        let batch = assemble_batch(vec![contact("a@x.com", "A", "")]);
        let mut mask = InclusionMask::new();
        mask.set(EmailKey::from_email("a@x.com"), false);
        let report = rec.apply(&batch, UpdateMode::Append, &mask).await.unwrap();
        assert!(!report.wrote);
        assert!(!rec.stats().await.unwrap().exists);
    }

    #[tokio::test]
    async fn search_matches_any_column_case_insensitively() {
        let dir = tempdir().expect("tempdir");
        let rec = reconciler(
            MemoryContactStore::with_rows(vec![contact("a@x.com", "Anna", ""), contact("b@y.org", "Bo", "555")]),
            dir.path(),
        );
        assert_eq!(rec.search("ANN").await.unwrap().len(), 1);
        assert_eq!(rec.search("555").await.unwrap()[0].name, "Bo");
        assert_eq!(rec.search("  ").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn point_op_failures_surface_as_validation_errors() {
        let dir = tempdir().expect("tempdir");
        let rec = reconciler(MemoryContactStore::with_rows(vec![contact("a@x.com", "A", "")]), dir.path());
        let err = rec.delete_row(&contact("zz@x.com", "", "")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(ValidationError::NoMatch)));
        assert_eq!(err.to_string(), "no stored row matches the given values");
    }

    #[tokio::test]
    async fn drop_snapshots_the_table_first() {
        let dir = tempdir().expect("tempdir");
        let rec = reconciler(MemoryContactStore::with_rows(vec![contact("a@x.com", "A", "")]), dir.path());
        let report = rec.drop_table().await.unwrap();
        assert!(report.existed);
        assert_eq!(report.rows_removed, 1);
        let manifest = report.snapshot.expect("snapshot taken");
        assert!(manifest.manifest_path.starts_with(dir.path().join("reports")));
        assert!(!rec.stats().await.unwrap().exists);
        assert!(rec.drop_table().await.unwrap().snapshot.is_none());
    }
}
