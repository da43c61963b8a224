//! In-process [`Store`] used for dry runs and tests.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    AttachmentRecord, MessageRecord, Recipient, Source, Store, StoreError, StoreResult,
    SyncProgress, SyncRun, SyncStatus,
};
use crate::mime::Address;

/// A committed message as held by [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub source_id: i64,
    pub source_message_id: String,
    pub conversation_id: i64,
    pub message_id_header: Option<String>,
    pub subject: String,
    pub snippet: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub sender_id: Option<i64>,
    pub is_from_me: bool,
    pub body_text: String,
    pub body_html: String,
    pub raw: Vec<u8>,
    pub recipients: Vec<Recipient>,
    pub labels: BTreeSet<i64>,
    pub attachments_pending: bool,
}

#[derive(Debug, Clone)]
struct Participant {
    id: i64,
    name: String,
}

#[derive(Default)]
struct State {
    next_id: i64,
    sources: Vec<Source>,
    syncs: Vec<SyncRun>,
    labels: HashMap<(i64, String), i64>,
    participants: HashMap<String, Participant>,
    conversations: HashMap<(i64, String), (i64, String)>,
    message_keys: HashMap<(i64, String), i64>,
    messages: HashMap<i64, StoredMessage>,
    attachments: HashMap<i64, Vec<AttachmentRecord>>,
}

impl State {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn sync_mut(&mut self, sync_id: i64) -> StoreResult<&mut SyncRun> {
        self.syncs
            .iter_mut()
            .find(|run| run.id == sync_id)
            .ok_or_else(|| StoreError::NotFound(format!("sync run {sync_id}")))
    }

    fn lookup(&self, source_id: i64, keys: &[String], committed_only: bool) -> HashMap<String, i64> {
        keys.iter()
            .filter_map(|key| {
                let id = *self.message_keys.get(&(source_id, key.clone()))?;
                let message = self.messages.get(&id)?;
                if committed_only && message.attachments_pending {
                    return None;
                }
                Some((key.clone(), id))
            })
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        let state = self.state.lock();
        let mut messages: Vec<StoredMessage> = state.messages.values().cloned().collect();
        messages.sort_by_key(|message| message.id);
        messages
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn message_by_key(&self, source_message_id: &str) -> Option<StoredMessage> {
        let state = self.state.lock();
        state
            .messages
            .values()
            .find(|message| message.source_message_id == source_message_id)
            .cloned()
    }

    /// Label names attached to a message, sorted.
    pub fn label_names(&self, message_id: i64) -> Vec<String> {
        let state = self.state.lock();
        let Some(message) = state.messages.get(&message_id) else {
            return Vec::new();
        };
        let mut names: Vec<String> = state
            .labels
            .iter()
            .filter(|(_, id)| message.labels.contains(*id))
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn attachments(&self, message_id: i64) -> Vec<AttachmentRecord> {
        self.state
            .lock()
            .attachments
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sync_runs(&self) -> Vec<SyncRun> {
        self.state.lock().syncs.clone()
    }

    pub fn participant_name(&self, email: &str) -> Option<String> {
        self.state
            .lock()
            .participants
            .get(email)
            .map(|participant| participant.name.clone())
    }

    pub fn conversation_count(&self) -> usize {
        self.state.lock().conversations.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_source(
        &self,
        source_type: &str,
        identifier: &str,
    ) -> StoreResult<Source> {
        let mut state = self.state.lock();
        if let Some(source) = state
            .sources
            .iter()
            .find(|s| s.source_type == source_type && s.identifier == identifier)
        {
            return Ok(source.clone());
        }
        let source = Source {
            id: state.allocate_id(),
            source_type: source_type.to_string(),
            identifier: identifier.to_string(),
        };
        state.sources.push(source.clone());
        Ok(source)
    }

    async fn get_active_sync(&self, source_id: i64) -> StoreResult<Option<SyncRun>> {
        let state = self.state.lock();
        Ok(state
            .syncs
            .iter()
            .filter(|run| run.source_id == source_id && run.status == SyncStatus::Running)
            .max_by_key(|run| (run.started_at, run.id))
            .cloned())
    }

    async fn start_sync(&self, source_id: i64, sync_type: &str) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let now = Utc::now();
        for run in state
            .syncs
            .iter_mut()
            .filter(|run| run.source_id == source_id && run.status == SyncStatus::Running)
        {
            run.status = SyncStatus::Failed;
            run.error_message = Some("superseded by new sync".to_string());
            run.completed_at = Some(now);
        }
        let id = state.allocate_id();
        state.syncs.push(SyncRun {
            id,
            source_id,
            sync_type: sync_type.to_string(),
            status: SyncStatus::Running,
            cursor: None,
            final_cursor: None,
            progress: SyncProgress::default(),
            error_message: None,
            started_at: now,
            completed_at: None,
        });
        Ok(id)
    }

    async fn update_sync_checkpoint(
        &self,
        sync_id: i64,
        cursor: &str,
        progress: &SyncProgress,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let run = state.sync_mut(sync_id)?;
        run.cursor = Some(cursor.to_string());
        run.progress = *progress;
        Ok(())
    }

    async fn complete_sync(&self, sync_id: i64, final_cursor: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let run = state.sync_mut(sync_id)?;
        run.status = SyncStatus::Completed;
        run.final_cursor = Some(final_cursor.to_string());
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_sync(&self, sync_id: i64, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let run = state.sync_mut(sync_id)?;
        run.status = SyncStatus::Failed;
        run.error_message = Some(message.to_string());
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn ensure_label(&self, source_id: i64, name: &str) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let key = (source_id, name.to_string());
        if let Some(id) = state.labels.get(&key) {
            return Ok(*id);
        }
        let id = state.allocate_id();
        state.labels.insert(key, id);
        Ok(id)
    }

    async fn message_exists_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        Ok(self.state.lock().lookup(source_id, keys, false))
    }

    async fn message_exists_with_raw_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        Ok(self.state.lock().lookup(source_id, keys, true))
    }

    async fn ensure_participants_batch(
        &self,
        addresses: &[Address],
    ) -> StoreResult<HashMap<String, i64>> {
        let mut state = self.state.lock();
        let mut ids = HashMap::new();
        for address in addresses.iter().filter(|a| !a.email.is_empty()) {
            let id = match state.participants.get_mut(&address.email) {
                Some(existing) => {
                    if existing.name.is_empty() && !address.name.is_empty() {
                        existing.name = address.name.clone();
                    }
                    existing.id
                }
                None => {
                    let id = state.allocate_id();
                    state.participants.insert(
                        address.email.clone(),
                        Participant {
                            id,
                            name: address.name.clone(),
                        },
                    );
                    id
                }
            };
            ids.insert(address.email.clone(), id);
        }
        Ok(ids)
    }

    async fn ensure_conversation(
        &self,
        source_id: i64,
        thread_key: &str,
        title: &str,
    ) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let key = (source_id, thread_key.to_string());
        if let Some((id, _)) = state.conversations.get(&key) {
            return Ok(*id);
        }
        let id = state.allocate_id();
        state.conversations.insert(key, (id, title.to_string()));
        Ok(id)
    }

    async fn persist_message(&self, record: &MessageRecord) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let key = (record.source_id, record.source_message_id.clone());
        let existing = state.message_keys.get(&key).copied();
        let id = match existing {
            Some(id) => id,
            None => state.allocate_id(),
        };

        let mut labels = existing
            .and_then(|id| state.messages.get(&id))
            .map(|message| message.labels.clone())
            .unwrap_or_default();
        labels.extend(record.label_ids.iter().copied());

        state.message_keys.insert(key, id);
        state.messages.insert(
            id,
            StoredMessage {
                id,
                source_id: record.source_id,
                source_message_id: record.source_message_id.clone(),
                conversation_id: record.conversation_id,
                message_id_header: record.message_id_header.clone(),
                subject: record.subject.clone(),
                snippet: record.snippet.clone(),
                sent_at: record.sent_at,
                sender_id: record.sender_id,
                is_from_me: record.is_from_me,
                body_text: record.body_text.clone(),
                body_html: record.body_html.clone(),
                raw: record.raw.clone(),
                recipients: record.recipients.clone(),
                labels,
                attachments_pending: record.attachment_count > 0,
            },
        );
        Ok(id)
    }

    async fn add_message_labels(&self, message_id: i64, label_ids: &[i64]) -> StoreResult<()> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.labels.extend(label_ids.iter().copied());
        Ok(())
    }

    async fn upsert_attachment(
        &self,
        message_id: i64,
        attachment: &AttachmentRecord,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        if !state.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        let rows = state.attachments.entry(message_id).or_default();
        match rows
            .iter()
            .position(|row| row.content_hash == attachment.content_hash)
        {
            Some(index) => rows[index] = attachment.clone(),
            None => rows.push(attachment.clone()),
        }
        Ok(())
    }

    async fn mark_attachments_stored(&self, message_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.attachments_pending = false;
        Ok(())
    }
}
