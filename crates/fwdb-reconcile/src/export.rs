//! CSV exports and parquet table snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use fwdb_core::{Column, ContactRecord, REQUIRED_COLUMNS, TABLE_NAME};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::diff::{Diff, EntryKind};

pub const DIFF_CSV_HEADER: [&str; 7] = [
    "Kind",
    "Email",
    "Name",
    "Surname",
    "Column",
    "Old Value",
    "New Value",
];

/// `prefix_YYYYmmdd_HHMMSS.csv`
pub fn export_filename(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

pub fn export_table_csv(rows: &[ContactRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(REQUIRED_COLUMNS)
        .context("writing table csv header")?;
    for row in rows {
        writer.write_record(row.values()).context("writing table csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing table csv: {}", err.error()))
}

/// One line per changed field for updates (sorted by email, then column),
/// one line per insert and duplicate.
pub fn export_diff_csv(diff: &Diff) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(DIFF_CSV_HEADER)
        .context("writing diff csv header")?;

    let mut changed = diff
        .updates
        .iter()
        .flat_map(|entry| entry.changes.iter().map(move |change| (entry, change)))
        .collect::<Vec<_>>();
    changed.sort_by(|a, b| {
        a.0.email
            .to_lowercase()
            .cmp(&b.0.email.to_lowercase())
            .then(a.1.column.cmp(&b.1.column))
    });
    for (entry, change) in changed {
        writer
            .write_record([
                EntryKind::Update.as_str(),
                entry.email.as_str(),
                entry.name.as_str(),
                entry.surname.as_str(),
                change.column.as_str(),
                change.display_old(),
                change.display_new(),
            ])
            .context("writing diff csv row")?;
    }

    for (kind, entry) in diff
        .entries()
        .filter(|(kind, _)| matches!(kind, EntryKind::Insert | EntryKind::Duplicate))
    {
        writer
            .write_record([
                kind.as_str(),
                entry.email.as_str(),
                entry.name.as_str(),
                entry.surname.as_str(),
                "",
                "",
                "",
            ])
            .context("writing diff csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing diff csv: {}", err.error()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub table: String,
    pub taken_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<SnapshotFile>,
    #[serde(skip)]
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `snapshots/<stamp>/contacts.parquet` plus a sha256 manifest under `reports_dir`.
pub fn write_table_snapshot(reports_dir: &Path, rows: &[ContactRecord], at: DateTime<Utc>) -> Result<SnapshotManifest> {
    let snapshot_dir = reports_dir
        .join("snapshots")
        .join(at.format("%Y%m%d_%H%M%S").to_string());
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let parquet_path = snapshot_dir.join("contacts.parquet");
    write_contacts_parquet(&parquet_path, rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        table: TABLE_NAME.to_string(),
        taken_at: at,
        rows: rows.len(),
        files: vec![manifest_entry(TABLE_NAME, reports_dir, &parquet_path)?],
        manifest_path: snapshot_dir.join("manifest.json"),
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest.manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest.manifest_path.display()))?;
    info!(rows = manifest.rows, path = %manifest.manifest_path.display(), "table snapshot written");
    Ok(manifest)
}

fn write_contacts_parquet(path: &Path, rows: &[ContactRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(
        Column::ALL
            .iter()
            .map(|column| ArrowField::new(column.as_str(), DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    let columns = Column::ALL
        .iter()
        .map(|column| {
            Arc::new(StringArray::from(
                rows.iter().map(|row| column.value(row)).collect::<Vec<_>>(),
            )) as arrow_array::ArrayRef
        })
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(schema, columns).context("building contacts record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
