use std::collections::HashSet;
use std::sync::Arc;

use fwdb_adapters::assemble_batch;
use fwdb_core::{Column, ContactRecord, EmailKey, UpdateMode};
use fwdb_reconcile::{
    compute_diff, ingest_file, plan_apply, InclusionMask, ReconcileConfig, Reconciler,
};
use fwdb_storage::{ContactStore, MemoryContactStore, SqliteContactStore};
use tempfile::tempdir;

fn contact(email: &str, name: &str, phone: &str) -> ContactRecord {
    ContactRecord {
        company: "Acme".to_string(),
        email: email.to_string(),
        name: name.to_string(),
        phone: phone.to_string(),
        ..Default::default()
    }
}

fn keys(rows: &[ContactRecord]) -> HashSet<EmailKey> {
    rows.iter().map(ContactRecord::key).collect()
}

async fn sqlite_reconciler(dir: &std::path::Path) -> Reconciler {
    let config = ReconcileConfig::in_dir(dir);
    let store = SqliteContactStore::connect(&config.database_url)
        .await
        .expect("connect");
    Reconciler::new(Arc::new(store), config)
}

#[test]
fn replace_keep_and_apply_partition_the_final_table() {
    let stored = vec![
        contact("a@x.com", "A", "1"),
        contact("b@x.com", "B", "2"),
        contact("c@x.com", "C", "3"),
    ];
    let batch = assemble_batch(vec![
        contact("b@x.com", "B", "20"),
        contact("c@x.com", "C", "3"),
        contact("d@x.com", "D", "4"),
    ]);
    let mut mask = InclusionMask::new();
    mask.set(EmailKey::from_email("d@x.com"), false);

    let plan = plan_apply(&batch, UpdateMode::Replace, &stored, &mask);
    let final_rows = plan.final_rows();
    assert_eq!(plan.keep.len() + plan.apply.len(), final_rows.len());
    assert!(keys(&plan.keep).is_disjoint(&keys(&plan.apply)));
    assert_eq!(plan.counts.excluded, 1);
    assert!(!keys(&final_rows).contains(&EmailKey::from_email("d@x.com")));
}

#[test]
fn append_only_adds_new_keys_and_reports_every_match() {
    let stored = vec![contact("a@x.com", "A", "1"), contact("b@x.com", "B", "2")];
    let batch = assemble_batch(vec![
        contact("a@x.com", "Changed", "9"),
        contact("e@x.com", "E", ""),
    ]);
    let diff = compute_diff(&batch, UpdateMode::Append, &stored);
    assert_eq!(keys_of(&diff.duplicates), HashSet::from([EmailKey::from_email("a@x.com")]));

    let plan = plan_apply(&batch, UpdateMode::Append, &stored, &InclusionMask::new());
    assert!(keys(&plan.apply).is_disjoint(&keys(&stored)));
    let final_rows = plan.final_rows();
    assert_eq!(&final_rows[..2], &stored[..]);
    assert_eq!(final_rows.len(), stored.len() + plan.apply.len());
}

fn keys_of(entries: &[fwdb_reconcile::DiffEntry]) -> HashSet<EmailKey> {
    entries.iter().map(|e| e.key.clone()).collect()
}

#[tokio::test]
async fn applying_the_same_replace_twice_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let rec = sqlite_reconciler(dir.path()).await;
    rec.store()
        .append(&[contact("a@x.com", "A", "1"), contact("b@x.com", "B", "2")])
        .await
        .unwrap();

    let batch = assemble_batch(vec![contact("b@x.com", "Bee", "2"), contact("c@x.com", "C", "3")]);
    let mask = InclusionMask::new();
    rec.apply(&batch, UpdateMode::Replace, &mask).await.unwrap();
    let once = rec.load_rows().await.unwrap();

    let second = rec.apply(&batch, UpdateMode::Replace, &mask).await.unwrap();
    assert!(!second.wrote);
    assert_eq!(second.counts.unchanged, 2);
    assert_eq!(rec.load_rows().await.unwrap(), once);
}

#[tokio::test]
async fn csv_export_round_trips_through_ingestion() {
    let dir = tempdir().expect("tempdir");
    let original = vec![
        ContactRecord::from_values(["Acme", "Ann", "Lee", "ann@acme.io", "CEO", "0044 1"].map(String::from)),
        ContactRecord::from_values(["", "Bo", "", "bo@x.com", "", ""].map(String::from)),
    ];
    let rec = Reconciler::new(
        Arc::new(MemoryContactStore::with_rows(original.clone())),
        ReconcileConfig::in_dir(dir.path()),
    );
    let csv = rec.export_table_csv().await.unwrap();
    let path = dir.path().join("export.csv");
    std::fs::write(&path, csv).unwrap();

    let ingested = ingest_file(&path, &[]).unwrap();
    let empty = Reconciler::new(Arc::new(MemoryContactStore::new()), ReconcileConfig::in_dir(dir.path()));
    empty
        .apply(&ingested.batch, UpdateMode::Replace, &InclusionMask::new())
        .await
        .unwrap();
    assert_eq!(empty.load_rows().await.unwrap(), original);
}

#[test]
fn duplicate_emails_within_a_batch_keep_the_last_record() {
    let batch = assemble_batch(vec![contact("a@x.com", "Jo", ""), contact("A@X.COM ", "Joe", "")]);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.records()[0].name, "Joe");
    assert_eq!(batch.records()[0].key().as_str(), "a@x.com");
}

#[tokio::test]
async fn three_new_rows_into_an_empty_store() {
    let dir = tempdir().expect("tempdir");
    let rec = sqlite_reconciler(dir.path()).await;
    let batch = assemble_batch(vec![
        contact("a@x.com", "A", ""),
        contact("b@x.com", "B", ""),
        contact("c@x.com", "C", ""),
    ]);
    let summary = rec.preview(&batch, UpdateMode::Replace).await.unwrap().summary();
    assert_eq!((summary.inserts, summary.updates, summary.duplicates), (3, 0, 0));

    let report = rec.apply(&batch, UpdateMode::Replace, &InclusionMask::new()).await.unwrap();
    assert_eq!((report.counts.inserted, report.counts.updated, report.counts.kept), (3, 0, 0));
    assert_eq!(rec.stats().await.unwrap().row_count, 3);
}

#[tokio::test]
async fn excluded_phone_change_leaves_the_store_unchanged() {
    let dir = tempdir().expect("tempdir");
    let rec = sqlite_reconciler(dir.path()).await;
    let stored = contact("b@x.com", "", "111");
    rec.store().append(&[stored.clone()]).await.unwrap();

    let batch = assemble_batch(vec![contact("b@x.com", "", "222")]);
    let diff = rec.preview(&batch, UpdateMode::Replace).await.unwrap();
    assert_eq!(diff.updates.len(), 1);
    let change = &diff.updates[0].changes;
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].column, Column::Phone);
    assert_eq!((change[0].old.as_str(), change[0].new.as_str()), ("111", "222"));

    let mut mask = InclusionMask::for_diff(&diff);
    mask.set(EmailKey::from_email("b@x.com"), false);
    let report = rec.apply(&batch, UpdateMode::Replace, &mask).await.unwrap();
    assert_eq!((report.counts.updated, report.counts.kept), (0, 1));
    assert_eq!(rec.load_rows().await.unwrap(), vec![stored]);
}

#[tokio::test]
async fn identical_row_in_append_mode_is_a_skipped_duplicate() {
    let dir = tempdir().expect("tempdir");
    let rec = sqlite_reconciler(dir.path()).await;
    let stored = contact("c@x.com", "C", "");
    rec.store().append(&[stored.clone()]).await.unwrap();

    let batch = assemble_batch(vec![stored.clone()]);
    let diff = rec.preview(&batch, UpdateMode::Append).await.unwrap();
    assert_eq!((diff.duplicates.len(), diff.inserts.len()), (1, 0));

    let report = rec.apply(&batch, UpdateMode::Append, &InclusionMask::new()).await.unwrap();
    assert_eq!((report.counts.inserted, report.counts.duplicates_skipped), (0, 1));
    assert_eq!(rec.load_rows().await.unwrap(), vec![stored]);
}
