//! Import driver shared by every source format.
//!
//! A [`MessageSource`] yields raw messages together with the cursor that
//! resumes after them. The driver batches them, asks the store once per batch
//! which dedup keys are already committed, normalizes the rest and persists
//! the cursor every `checkpoint_interval` messages.
//!
//! The saved cursor never moves past a message whose commit failed or whose
//! attachments could not be stored: once that happens the checkpoint stays
//! frozen for the rest of the run.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::attachments::{AttachmentContentStore, sha256_hex};
use crate::config::{DEFAULT_BATCH_BYTES, DEFAULT_BATCH_MESSAGES, DEFAULT_CHECKPOINT_INTERVAL};
use crate::error::ImportError;
use crate::mime::MimeParser;
use crate::store::{Store, SyncProgress};

use super::ImportOptions;
use super::checkpoint;
use super::normalizer::{MessageNormalizer, RawInput};
use super::summary::ImportSummary;

/// One raw message produced by a source.
#[derive(Debug, Clone)]
pub(crate) struct Candidate<C> {
    pub raw: Vec<u8>,
    pub fallback_date: Option<DateTime<Utc>>,
    /// Label contributed by the source itself (the emlx mailbox).
    pub label: Option<String>,
    /// Cursor that resumes right after this message.
    pub position: C,
}

pub(crate) enum SourceEvent<C> {
    Message(Candidate<C>),
    /// One message could not be read; reading continues at `resume_at`.
    Unreadable { reason: String, resume_at: C },
    /// The source cannot be read any further.
    Aborted { reason: String },
    /// End of a mailbox. Pending messages are flushed before moving on.
    GroupEnd,
}

/// Format-specific half of an import.
pub(crate) trait MessageSource {
    type Cursor: Clone + Serialize + DeserializeOwned;

    const SYNC_TYPE: &'static str;
    const DEFAULT_SOURCE_TYPE: &'static str;

    fn describe(&self) -> String;

    fn initial_cursor(&self) -> Self::Cursor;

    /// Check that a stored cursor belongs to this source.
    fn accept_cursor(&self, cursor: Self::Cursor) -> Result<Self::Cursor, ImportError>;

    /// Position the source at `from`. `fresh` is true when nothing has been
    /// processed by the run yet.
    fn open(&mut self, from: &Self::Cursor, fresh: bool) -> Result<(), ImportError>;

    fn next_event(&mut self) -> Option<SourceEvent<Self::Cursor>>;

    fn dedup_key(&self, raw_hash: &str, position: &Self::Cursor) -> String;

    /// Abandon the rest of the current mailbox.
    fn skip_group(&mut self) {}

    fn group_total(&self) -> usize {
        0
    }

    /// Cursor to record once the source is drained, if it differs from the
    /// position after the last message.
    fn drained_cursor(&self, _last: &Self::Cursor) -> Option<Self::Cursor> {
        None
    }

    /// Cursor text recorded on a completed run.
    fn completion_cursor(&self, summary: &ImportSummary) -> String;
}

enum Pending<C> {
    Message {
        raw: Vec<u8>,
        raw_hash: String,
        dedup_key: String,
        fallback_date: Option<DateTime<Utc>>,
        label_ids: Vec<i64>,
        position: C,
    },
    Unreadable {
        resume_at: C,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

struct Run<'a, S: MessageSource> {
    store: &'a dyn Store,
    cancel: &'a CancellationToken,
    normalizer: MessageNormalizer<'a>,
    source: S,
    source_id: i64,
    sync_id: i64,
    checkpoint_interval: i64,
    batch_messages: usize,
    batch_bytes: u64,
    started: Instant,
    progress: SyncProgress,
    summary: ImportSummary,
    checkpoint: S::Cursor,
    checkpoint_blocked: bool,
    base_labels: Vec<i64>,
    labels: HashMap<String, i64>,
    pending: Vec<Pending<S::Cursor>>,
    pending_index: HashMap<String, usize>,
    pending_messages: usize,
    pending_bytes: u64,
}

pub(crate) fn or_default<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() { default } else { value }
}

/// Run one import of `source` to completion, failure or cancellation.
pub(crate) async fn run_import<S: MessageSource>(
    store: &dyn Store,
    parser: &dyn MimeParser,
    cancel: &CancellationToken,
    options: &ImportOptions,
    mut source: S,
) -> Result<ImportSummary, ImportError> {
    let started = Instant::now();
    let identifier = options.identifier.trim();
    if identifier.is_empty() {
        return Err(ImportError::MissingIdentifier);
    }
    let source_type = options
        .source_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(S::DEFAULT_SOURCE_TYPE);

    let src = store.get_or_create_source(source_type, identifier).await?;

    let mut summary = ImportSummary {
        mailboxes_total: source.group_total(),
        ..ImportSummary::default()
    };
    let mut progress = SyncProgress::default();
    let mut start_at = source.initial_cursor();
    let mut sync_id = None;

    if !options.no_resume {
        if let Some(active) = store.get_active_sync(src.id).await? {
            sync_id = Some(active.id);
            progress = active.progress;
            let stored = active.cursor.as_deref().filter(|c| !c.is_empty());
            if let Some(cursor) = stored.and_then(checkpoint::decode::<S::Cursor>) {
                start_at = source.accept_cursor(cursor)?;
                summary.was_resumed = true;
                summary.resumed_from = stored.map(str::to_string);
                log::info!(
                    "resuming import of {} (sync {}, {} processed so far)",
                    source.describe(),
                    active.id,
                    progress.processed
                );
            } else {
                log::info!(
                    "reusing running sync {} for {} from the start",
                    active.id,
                    source.describe()
                );
            }
        }
    }

    let sync_id = match sync_id {
        Some(id) => id,
        None => store.start_sync(src.id, S::SYNC_TYPE).await?,
    };
    log::info!(
        "importing {} as {} source {} (sync {})",
        source.describe(),
        source_type,
        identifier,
        sync_id
    );

    let fresh = progress.processed == 0;
    let attachments = AttachmentContentStore::new(options.attachments_dir.clone());
    let normalizer = MessageNormalizer::new(store, parser, &attachments, src.id, identifier);

    if let Err(err) = source.open(&start_at, fresh) {
        log::error!("cannot import {}: {}", source.describe(), err);
        if let Err(fail_err) = store.fail_sync(sync_id, &err.to_string()).await {
            log::warn!("failed to mark sync {} failed: {}", sync_id, fail_err);
        }
        return Err(err);
    }

    let mut run = Run {
        store,
        cancel,
        normalizer,
        source,
        source_id: src.id,
        sync_id,
        checkpoint_interval: or_default(options.checkpoint_interval, DEFAULT_CHECKPOINT_INTERVAL)
            as i64,
        batch_messages: or_default(options.batch_messages, DEFAULT_BATCH_MESSAGES),
        batch_bytes: or_default(options.batch_bytes, DEFAULT_BATCH_BYTES),
        started,
        progress,
        summary,
        checkpoint: start_at,
        checkpoint_blocked: false,
        base_labels: Vec::new(),
        labels: HashMap::new(),
        pending: Vec::new(),
        pending_index: HashMap::new(),
        pending_messages: 0,
        pending_bytes: 0,
    };

    // Record which source this run belongs to before any message is read.
    run.save_checkpoint().await;

    if let Some(label) = options.label.as_deref().filter(|l| !l.is_empty()) {
        match store.ensure_label(src.id, label).await {
            Ok(id) => run.base_labels.push(id),
            Err(err) => {
                log::error!("failed to ensure label {:?}: {}", label, err);
                if let Err(fail_err) = store.fail_sync(sync_id, &err.to_string()).await {
                    log::warn!("failed to mark sync {} failed: {}", sync_id, fail_err);
                }
                return Err(err.into());
            }
        }
    }

    run.drive().await
}

impl<'a, S: MessageSource> Run<'a, S> {
    async fn drive(mut self) -> Result<ImportSummary, ImportError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.interrupt().await);
            }
            let Some(event) = self.source.next_event() else {
                break;
            };

            match event {
                SourceEvent::Message(candidate) => self.enqueue(candidate).await,
                SourceEvent::Unreadable { reason, resume_at } => {
                    self.soft_error();
                    log::warn!("skipping unreadable message in {}: {}", self.source.describe(), reason);
                    self.pending.push(Pending::Unreadable { resume_at });
                }
                SourceEvent::Aborted { reason } => {
                    self.soft_error();
                    self.summary.hard_errors = true;
                    self.checkpoint_blocked = true;
                    log::error!("stopped reading {}: {}", self.source.describe(), reason);
                    break;
                }
                SourceEvent::GroupEnd => {
                    if self.flush().await == Flow::Cancelled {
                        return Ok(self.interrupt().await);
                    }
                    self.summary.mailboxes_imported += 1;
                    continue;
                }
            }

            if self.pending_messages >= self.batch_messages || self.pending_bytes >= self.batch_bytes {
                if self.flush().await == Flow::Cancelled {
                    return Ok(self.interrupt().await);
                }
            }
        }

        if self.flush().await == Flow::Cancelled {
            return Ok(self.interrupt().await);
        }
        self.finish().await
    }

    fn soft_error(&mut self) {
        self.progress.errors += 1;
        self.summary.errors += 1;
    }

    fn advance(&mut self, position: S::Cursor) {
        if !self.checkpoint_blocked {
            self.checkpoint = position;
        }
    }

    async fn save_checkpoint(&mut self) {
        let cursor = match checkpoint::encode(&self.checkpoint) {
            Ok(cursor) => cursor,
            Err(err) => {
                self.soft_error();
                log::warn!("failed to encode checkpoint: {}", err);
                return;
            }
        };
        if let Err(err) = self
            .store
            .update_sync_checkpoint(self.sync_id, &cursor, &self.progress)
            .await
        {
            self.soft_error();
            log::warn!("failed to save checkpoint for sync {}: {}", self.sync_id, err);
        }
    }

    async fn checkpoint_if_due(&mut self) {
        if self.progress.processed % self.checkpoint_interval == 0 {
            self.save_checkpoint().await;
        }
    }

    async fn resolve_label(&mut self, name: &str) -> Option<i64> {
        if let Some(id) = self.labels.get(name) {
            return Some(*id);
        }
        match self.store.ensure_label(self.source_id, name).await {
            Ok(id) => {
                self.labels.insert(name.to_string(), id);
                Some(id)
            }
            Err(err) => {
                self.soft_error();
                log::warn!("failed to ensure label {:?}: {}", name, err);
                None
            }
        }
    }

    async fn enqueue(&mut self, candidate: Candidate<S::Cursor>) {
        let mut label_ids = self.base_labels.clone();
        if let Some(name) = candidate.label.as_deref() {
            match self.resolve_label(name).await {
                Some(id) if !label_ids.contains(&id) => label_ids.push(id),
                Some(_) => {}
                None => {
                    self.source.skip_group();
                    return;
                }
            }
        }

        let raw_hash = sha256_hex(&candidate.raw);
        let dedup_key = self.source.dedup_key(&raw_hash, &candidate.position);

        if let Some(&index) = self.pending_index.get(&dedup_key) {
            if let Some(Pending::Message { label_ids: existing, .. }) = self.pending.get_mut(index) {
                for id in label_ids {
                    if !existing.contains(&id) {
                        existing.push(id);
                    }
                }
            }
            log::debug!("merged duplicate {} within batch", dedup_key);
            return;
        }

        self.pending_bytes += candidate.raw.len() as u64;
        self.pending_messages += 1;
        self.pending_index.insert(dedup_key.clone(), self.pending.len());
        self.pending.push(Pending::Message {
            raw: candidate.raw,
            raw_hash,
            dedup_key,
            fallback_date: candidate.fallback_date,
            label_ids,
            position: candidate.position,
        });
    }

    async fn flush(&mut self) -> Flow {
        if self.pending.is_empty() {
            return Flow::Continue;
        }
        let pending = std::mem::take(&mut self.pending);
        self.pending_index.clear();
        self.pending_messages = 0;
        self.pending_bytes = 0;

        let keys: Vec<String> = pending
            .iter()
            .filter_map(|entry| match entry {
                Pending::Message { dedup_key, .. } => Some(dedup_key.clone()),
                Pending::Unreadable { .. } => None,
            })
            .collect();
        log::debug!("checking {} messages against the store", keys.len());

        let committed = match self
            .store
            .message_exists_with_raw_batch(self.source_id, &keys)
            .await
        {
            Ok(found) => Some(found),
            Err(err) => {
                self.soft_error();
                log::warn!("batched commit check failed, checking one by one: {}", err);
                None
            }
        };
        let existing = match self.store.message_exists_batch(self.source_id, &keys).await {
            Ok(found) => Some(found),
            Err(err) => {
                self.soft_error();
                log::warn!("batched existence check failed, checking one by one: {}", err);
                None
            }
        };

        for entry in pending {
            if self.cancel.is_cancelled() {
                return Flow::Cancelled;
            }
            match entry {
                Pending::Unreadable { resume_at } => self.advance(resume_at),
                Pending::Message {
                    raw,
                    raw_hash,
                    dedup_key,
                    fallback_date,
                    label_ids,
                    position,
                } => {
                    let input = RawInput {
                        raw: &raw,
                        raw_hash: &raw_hash,
                        dedup_key: &dedup_key,
                        fallback_date,
                        label_ids: &label_ids,
                    };
                    self.process(input, position, committed.as_ref(), existing.as_ref())
                        .await;
                }
            }
        }
        Flow::Continue
    }

    async fn committed_id(
        &mut self,
        key: &str,
        batch: Option<&HashMap<String, i64>>,
    ) -> Option<i64> {
        if let Some(found) = batch {
            return found.get(key).copied();
        }
        match self
            .store
            .message_exists_with_raw_batch(self.source_id, &[key.to_string()])
            .await
        {
            Ok(found) => found.get(key).copied(),
            Err(err) => {
                self.soft_error();
                log::warn!("commit check for {} failed, importing anyway: {}", key, err);
                None
            }
        }
    }

    async fn exists(&mut self, key: &str, batch: Option<&HashMap<String, i64>>) -> bool {
        if let Some(found) = batch {
            return found.contains_key(key);
        }
        match self
            .store
            .message_exists_batch(self.source_id, &[key.to_string()])
            .await
        {
            Ok(found) => found.contains_key(key),
            Err(err) => {
                self.soft_error();
                log::warn!("existence check for {} failed, counting as added: {}", key, err);
                false
            }
        }
    }

    async fn process(
        &mut self,
        input: RawInput<'_>,
        position: S::Cursor,
        committed: Option<&HashMap<String, i64>>,
        existing: Option<&HashMap<String, i64>>,
    ) {
        self.progress.processed += 1;
        self.summary.processed += 1;
        self.summary.bytes_processed += input.raw.len() as u64;

        if let Some(message_id) = self.committed_id(input.dedup_key, committed).await {
            self.summary.skipped += 1;
            if !input.label_ids.is_empty() {
                if let Err(err) = self.store.add_message_labels(message_id, input.label_ids).await {
                    log::warn!("failed to add labels to message {}: {}", message_id, err);
                }
            }
            log::debug!("skipping committed message {}", input.dedup_key);
            self.advance(position);
            self.checkpoint_if_due().await;
            return;
        }

        let already_exists = self.exists(input.dedup_key, existing).await;

        let result = self.normalizer.normalize(input).await;
        match result {
            Ok(normalized) => {
                if already_exists {
                    self.progress.updated += 1;
                    self.summary.updated += 1;
                } else {
                    self.progress.added += 1;
                    self.summary.added += 1;
                }
                if normalized.attachment_errors.is_empty() {
                    self.advance(position);
                } else {
                    self.soft_error();
                    self.checkpoint_blocked = true;
                    log::warn!(
                        "message {} committed with {} attachment failures; it will be retried",
                        input.dedup_key,
                        normalized.attachment_errors.len()
                    );
                }
                self.checkpoint_if_due().await;
            }
            Err(err) => {
                self.soft_error();
                self.summary.hard_errors = true;
                self.checkpoint_blocked = true;
                log::error!("failed to commit message {}: {}", input.dedup_key, err);
            }
        }
    }

    async fn interrupt(mut self) -> ImportSummary {
        self.save_checkpoint().await;
        self.summary.interrupted = true;
        self.summary.duration = self.started.elapsed();
        log::info!(
            "import of {} interrupted; sync {} left running for resume",
            self.source.describe(),
            self.sync_id
        );
        self.summary
    }

    async fn finish(mut self) -> Result<ImportSummary, ImportError> {
        if !self.checkpoint_blocked {
            if let Some(drained) = self.source.drained_cursor(&self.checkpoint) {
                self.checkpoint = drained;
            }
        }
        self.save_checkpoint().await;
        self.summary.duration = self.started.elapsed();

        if self.summary.hard_errors {
            let message = format!("completed with {} errors", self.progress.errors);
            self.store.fail_sync(self.sync_id, &message).await?;
            log::error!("import of {} failed: {}", self.source.describe(), self.summary);
            return Ok(self.summary);
        }

        let mut final_cursor = self.source.completion_cursor(&self.summary);
        if self.progress.errors > 0 {
            final_cursor = format!("{} errors:{}", final_cursor, self.progress.errors);
        }
        self.store.complete_sync(self.sync_id, &final_cursor).await?;
        self.summary.final_cursor = Some(final_cursor);
        log::info!("imported {}: {}", self.source.describe(), self.summary);
        Ok(self.summary)
    }
}
