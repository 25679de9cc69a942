//! Hash-addressed upload storage.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredUpload {
    pub content_hash: String,
    pub file_name: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<hash>/<sanitized file name>`; keeping the original extension lets the
    /// reader pick an engine from the path.
    pub fn upload_relative_path(&self, content_hash: &str, file_name: &str) -> PathBuf {
        PathBuf::from(content_hash).join(sanitize_file_name(file_name))
    }

    /// Write upload bytes once per content hash using a temp file + atomic rename.
    pub async fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredUpload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.upload_relative_path(&content_hash, file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(&content_hash);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating upload directory {}", parent.display()))?;

        let stored = |deduplicated| StoredUpload {
            content_hash: content_hash.clone(),
            file_name: file_name.to_string(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking upload path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp upload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp upload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp upload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => {
                info!(hash = %content_hash, file_name, bytes = bytes.len(), "stored upload");
                Ok(stored(false))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp upload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Remove uploads older than `cutoff`; returns how many were removed.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(0);
        }
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from);
            if matches!(modified, Ok(ts) if ts < cutoff) {
                fs::remove_dir_all(entry.path())
                    .await
                    .with_context(|| format!("removing {}", entry.path().display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn sanitize_file_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upload_hashing_is_stable() {
        assert_eq!(
            UploadStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn file_names_are_flattened_and_keep_their_extension() {
        assert_eq!(sanitize_file_name("../../etc/Leads 2024.xlsx"), "Leads_2024.xlsx");
        assert_eq!(sanitize_file_name(".hidden.csv"), "hidden.csv");
        assert_eq!(sanitize_file_name(""), "upload.bin");
    }

    #[tokio::test]
    async fn identical_uploads_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path());

        let first = store.store_bytes("contacts.csv", b"Email\na@x.com\n").await.expect("first");
        let second = store.store_bytes("contacts.csv", b"Email\na@x.com\n").await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.absolute_path, second.absolute_path);
        assert!(first.absolute_path.ends_with("contacts.csv"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn pruning_removes_old_upload_directories() {
        let dir = tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path());
        store.store_bytes("a.csv", b"x").await.expect("store");
        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.prune_older_than(future).await.expect("prune"), 1);
        assert_eq!(store.prune_older_than(future).await.expect("prune"), 0);
    }
}
