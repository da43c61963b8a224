#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use archive_importer::mime::Address;
use archive_importer::store::{
    AttachmentRecord, MessageRecord, Source, StoreError, StoreResult, SyncProgress, SyncRun,
};
use archive_importer::{ImportOptions, MemoryStore, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub const OWNER: &str = "me@example.com";

/// [`MemoryStore`] wrapper that fails selected calls on demand.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    fail_subjects: Mutex<HashSet<String>>,
    fail_labels: Mutex<HashSet<String>>,
    fail_batch_checks: AtomicBool,
    persisted: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `persist_message` for records with this subject.
    pub fn fail_persist_for(&self, subject: &str) {
        self.fail_subjects.lock().insert(subject.to_string());
    }

    pub fn fail_label(&self, name: &str) {
        self.fail_labels.lock().insert(name.to_string());
    }

    pub fn fail_batch_checks(&self, enabled: bool) {
        self.fail_batch_checks.store(enabled, Ordering::SeqCst);
    }

    /// Cancel `token` once `count` messages have been persisted.
    pub fn cancel_after(&self, count: usize, token: &CancellationToken) {
        *self.cancel_after.lock() = Some((count, token.clone()));
    }

    pub fn clear_faults(&self) {
        self.fail_subjects.lock().clear();
        self.fail_labels.lock().clear();
        self.fail_batch_checks(false);
        *self.cancel_after.lock() = None;
    }

    pub fn persisted(&self) -> usize {
        self.persisted.load(Ordering::SeqCst)
    }

    fn batch_fault(&self, keys: &[String]) -> StoreResult<()> {
        if keys.len() > 1 && self.fail_batch_checks.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("batch lookup unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn get_or_create_source(
        &self,
        source_type: &str,
        identifier: &str,
    ) -> StoreResult<Source> {
        self.inner.get_or_create_source(source_type, identifier).await
    }

    async fn get_active_sync(&self, source_id: i64) -> StoreResult<Option<SyncRun>> {
        self.inner.get_active_sync(source_id).await
    }

    async fn start_sync(&self, source_id: i64, sync_type: &str) -> StoreResult<i64> {
        self.inner.start_sync(source_id, sync_type).await
    }

    async fn update_sync_checkpoint(
        &self,
        sync_id: i64,
        cursor: &str,
        progress: &SyncProgress,
    ) -> StoreResult<()> {
        self.inner.update_sync_checkpoint(sync_id, cursor, progress).await
    }

    async fn complete_sync(&self, sync_id: i64, final_cursor: &str) -> StoreResult<()> {
        self.inner.complete_sync(sync_id, final_cursor).await
    }

    async fn fail_sync(&self, sync_id: i64, message: &str) -> StoreResult<()> {
        self.inner.fail_sync(sync_id, message).await
    }

    async fn ensure_label(&self, source_id: i64, name: &str) -> StoreResult<i64> {
        if self.fail_labels.lock().contains(name) {
            return Err(StoreError::Backend(format!("label {name} unavailable")));
        }
        self.inner.ensure_label(source_id, name).await
    }

    async fn message_exists_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        self.batch_fault(keys)?;
        self.inner.message_exists_batch(source_id, keys).await
    }

    async fn message_exists_with_raw_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        self.batch_fault(keys)?;
        self.inner.message_exists_with_raw_batch(source_id, keys).await
    }

    async fn ensure_participants_batch(
        &self,
        addresses: &[Address],
    ) -> StoreResult<HashMap<String, i64>> {
        self.inner.ensure_participants_batch(addresses).await
    }

    async fn ensure_conversation(
        &self,
        source_id: i64,
        thread_key: &str,
        title: &str,
    ) -> StoreResult<i64> {
        self.inner.ensure_conversation(source_id, thread_key, title).await
    }

    async fn persist_message(&self, record: &MessageRecord) -> StoreResult<i64> {
        if self.fail_subjects.lock().contains(&record.subject) {
            return Err(StoreError::Backend(format!(
                "refusing to persist {:?}",
                record.subject
            )));
        }
        let id = self.inner.persist_message(record).await?;
        let count = self.persisted.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = self.cancel_after.lock().as_ref() {
            if count >= *limit {
                token.cancel();
            }
        }
        Ok(id)
    }

    async fn add_message_labels(&self, message_id: i64, label_ids: &[i64]) -> StoreResult<()> {
        self.inner.add_message_labels(message_id, label_ids).await
    }

    async fn upsert_attachment(
        &self,
        message_id: i64,
        attachment: &AttachmentRecord,
    ) -> StoreResult<()> {
        self.inner.upsert_attachment(message_id, attachment).await
    }

    async fn mark_attachments_stored(&self, message_id: i64) -> StoreResult<()> {
        self.inner.mark_attachments_stored(message_id).await
    }
}

/// Options with small batches and attachments written under `attachments`.
pub fn options(attachments: &Path) -> ImportOptions {
    let mut options = ImportOptions::new(OWNER);
    options.checkpoint_interval = 1;
    options.batch_messages = 1;
    options.attachments_dir = attachments.to_path_buf();
    options.max_message_bytes = 0;
    options.unescape_from = true;
    options
}

pub fn message(subject: &str, day: u32) -> String {
    format!(
        "From: Alice <alice@example.com>\n\
         To: me@example.com\n\
         Subject: {subject}\n\
         Date: Mon, {day:02} Jan 2024 10:00:00 +0000\n\
         Message-ID: <{subject}-{day}@example.com>\n\
         \n\
         Body of {subject}.\n"
    )
}

/// mbox text holding one message per subject.
pub fn mbox(subjects: &[&str]) -> String {
    subjects
        .iter()
        .enumerate()
        .map(|(index, subject)| {
            format!(
                "From alice@example.com Mon Jan {:02} 10:00:00 2024\n{}",
                index + 1,
                message(subject, index as u32 + 1)
            )
        })
        .collect()
}

pub fn write_file(path: &Path, content: impl AsRef<[u8]>) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, content).expect("write file");
    path.to_path_buf()
}

/// Write `body` as an emlx file (byte count, message, plist trailer).
pub fn write_emlx(messages_dir: &Path, name: &str, body: &str) {
    let trailer = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\"><dict></dict></plist>\n";
    let content = format!("{}\n{}{}", body.len(), body, trailer);
    write_file(&messages_dir.join(name), content);
}

/// Subjects of every stored message, sorted.
pub fn subjects(store: &MemoryStore) -> Vec<String> {
    let mut subjects: Vec<String> = store
        .messages()
        .into_iter()
        .map(|message| message.subject)
        .collect();
    subjects.sort();
    subjects
}

/// Number of regular files anywhere under `dir`.
pub fn file_count(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count()
}

pub async fn import_mbox(
    store: &dyn Store,
    path: &Path,
    options: &ImportOptions,
) -> archive_importer::ImportSummary {
    archive_importer::import_mbox(store, path, options, &CancellationToken::new())
        .await
        .expect("import succeeds")
}
