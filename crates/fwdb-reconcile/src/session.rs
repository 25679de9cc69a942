//! Per-upload reconciliation state and the slot that holds it.

use std::path::PathBuf;

use fwdb_adapters::{Batch, IngestReport};
use fwdb_core::{ContactRecord, EmailKey, UpdateMode};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::apply::{plan_apply, ApplyPlan, InclusionMask};
use crate::diff::{compute_diff, Diff};

/// Which upload (and sheet selection) a session was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadIdentity {
    pub content_hash: String,
    pub file_name: String,
    pub sheets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcileSession {
    pub upload: UploadIdentity,
    pub stored_path: PathBuf,
    pub batch: Batch,
    pub report: IngestReport,
    mode: UpdateMode,
    diff: Diff,
    mask: InclusionMask,
}

impl ReconcileSession {
    pub fn new(
        upload: UploadIdentity,
        stored_path: PathBuf,
        batch: Batch,
        report: IngestReport,
        mode: UpdateMode,
        stored: &[ContactRecord],
    ) -> Self {
        let diff = compute_diff(&batch, mode, stored);
        let mask = InclusionMask::for_diff(&diff);
        Self {
            upload,
            stored_path,
            batch,
            report,
            mode,
            diff,
            mask,
        }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn diff(&self) -> &Diff {
        &self.diff
    }

    pub fn mask(&self) -> &InclusionMask {
        &self.mask
    }

    /// Switching mode recomputes the diff and starts from an all-included mask.
    pub fn set_mode(&mut self, mode: UpdateMode, stored: &[ContactRecord]) {
        self.mode = mode;
        self.diff = compute_diff(&self.batch, mode, stored);
        self.mask = InclusionMask::for_diff(&self.diff);
    }

    /// Recompute against the current store, keeping decisions for keys that
    /// are still actionable.
    pub fn refresh(&mut self, stored: &[ContactRecord]) {
        self.diff = compute_diff(&self.batch, self.mode, stored);
        self.mask = self.mask.carried_over(&self.diff);
    }

    /// Returns the new state, or `None` when the key has nothing to apply.
    pub fn toggle(&mut self, key: &EmailKey) -> Option<bool> {
        self.diff
            .is_actionable(key)
            .then(|| self.mask.toggle(key))
    }

    pub fn select_all(&mut self, included: bool) {
        let keys = self.diff.actionable_keys();
        if included {
            self.mask.include_all(keys);
        } else {
            self.mask.exclude_all(keys);
        }
    }

    pub fn included_count(&self) -> usize {
        self.diff
            .actionable_keys()
            .iter()
            .filter(|key| self.mask.is_included(key))
            .count()
    }

    pub fn plan(&self, stored: &[ContactRecord]) -> ApplyPlan {
        plan_apply(&self.batch, self.mode, stored, &self.mask)
    }
}

/// Holds at most one in-flight session; operations on it are serialized.
#[derive(Debug, Default)]
pub struct SessionSlot {
    inner: Mutex<Option<ReconcileSession>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Option<ReconcileSession>> {
        self.inner.lock().await
    }

    /// Install `session` unless the same upload is already in progress.
    /// Returns `true` when the slot now holds the new session.
    pub async fn begin(&self, session: ReconcileSession) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.as_ref().is_some_and(|current| current.upload == session.upload) {
            return false;
        }
        info!(
            file = %session.upload.file_name,
            hash = %session.upload.content_hash,
            rows = session.batch.len(),
            "reconciliation session started"
        );
        *guard = Some(session);
        true
    }

    pub async fn current_upload(&self) -> Option<UploadIdentity> {
        self.inner.lock().await.as_ref().map(|s| s.upload.clone())
    }

    pub async fn clear(&self) -> bool {
        self.inner.lock().await.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwdb_adapters::assemble_batch;

    fn contact(email: &str, phone: &str) -> ContactRecord {
        ContactRecord {
            email: email.to_string(),
            phone: phone.to_string(),
            ..Default::default()
        }
    }

    fn session(hash: &str, stored: &[ContactRecord]) -> ReconcileSession {
        ReconcileSession::new(
            UploadIdentity {
                content_hash: hash.to_string(),
                file_name: "contacts.xlsx".to_string(),
                sheets: vec!["Sheet1".to_string()],
            },
            PathBuf::from("uploads/contacts.xlsx"),
            assemble_batch(vec![contact("a@x.com", "1"), contact("b@x.com", "2")]),
            IngestReport::default(),
            UpdateMode::Replace,
            stored,
        )
    }

    #[tokio::test]
    async fn resubmitting_the_same_upload_keeps_the_session() {
        let slot = SessionSlot::new();
        assert!(slot.begin(session("h1", &[])).await);
        {
            let mut guard = slot.lock().await;
            let current = guard.as_mut().unwrap();
            current.toggle(&EmailKey::from_email("a@x.com"));
        }
        assert!(!slot.begin(session("h1", &[])).await);
        assert_eq!(slot.lock().await.as_ref().unwrap().included_count(), 1);

        assert!(slot.begin(session("h2", &[])).await);
        assert_eq!(slot.lock().await.as_ref().unwrap().included_count(), 2);
        assert!(slot.clear().await);
        assert!(slot.current_upload().await.is_none());
    }

    #[test]
    fn mode_switch_reseeds_and_refresh_preserves_the_mask() {
        let stored = vec![contact("a@x.com", "0")];
        let mut s = session("h", &stored);
        assert_eq!(s.diff().updates.len(), 1);
        assert_eq!(s.toggle(&EmailKey::from_email("b@x.com")), Some(false));
        assert_eq!(s.toggle(&EmailKey::from_email("zzz@x.com")), None);

        s.refresh(&stored);
        assert!(!s.mask().is_included(&EmailKey::from_email("b@x.com")));

        s.set_mode(UpdateMode::Append, &stored);
        assert_eq!(s.diff().duplicates.len(), 1);
        assert!(s.mask().is_included(&EmailKey::from_email("b@x.com")));

        s.select_all(false);
        assert_eq!(s.included_count(), 0);
        assert!(s.plan(&stored).is_noop());
    }
}
