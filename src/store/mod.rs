//! Durable store seam.
//!
//! The importer talks to persistence only through [`Store`]. [`PgStore`] is
//! the production implementation on PostgreSQL; [`MemoryStore`] keeps the
//! same semantics in process for dry runs and tests.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, StoredMessage};
pub use postgres::{MIGRATOR, PgStore};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mime::Address;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: i64,
    pub source_type: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "sync_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

/// Cumulative counters carried by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub processed: i64,
    pub added: i64,
    pub updated: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncRun {
    pub id: i64,
    pub source_id: i64,
    pub sync_type: String,
    pub status: SyncStatus,
    /// Opaque resume cursor written by the importer.
    pub cursor: Option<String>,
    pub final_cursor: Option<String>,
    pub progress: SyncProgress,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    From,
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientKind::From => "from",
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub participant_id: i64,
    pub display_name: String,
}

/// Everything committed for one message in a single transaction.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub source_id: i64,
    /// Dedup key.
    pub source_message_id: String,
    pub conversation_id: i64,
    pub message_id_header: Option<String>,
    pub subject: String,
    pub snippet: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub sender_id: Option<i64>,
    pub is_from_me: bool,
    pub size_estimate: i64,
    pub attachment_count: i32,
    pub body_text: String,
    pub body_html: String,
    pub raw: Vec<u8>,
    pub raw_hash: String,
    pub recipients: Vec<Recipient>,
    pub label_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub filename: String,
    pub content_type: String,
    pub storage_path: String,
    pub content_hash: String,
    pub size: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_or_create_source(&self, source_type: &str, identifier: &str)
    -> StoreResult<Source>;

    /// Newest run of `source_id` still marked running.
    async fn get_active_sync(&self, source_id: i64) -> StoreResult<Option<SyncRun>>;

    /// Start a run, marking any other running run of the source failed.
    async fn start_sync(&self, source_id: i64, sync_type: &str) -> StoreResult<i64>;

    async fn update_sync_checkpoint(
        &self,
        sync_id: i64,
        cursor: &str,
        progress: &SyncProgress,
    ) -> StoreResult<()>;

    async fn complete_sync(&self, sync_id: i64, final_cursor: &str) -> StoreResult<()>;

    async fn fail_sync(&self, sync_id: i64, message: &str) -> StoreResult<()>;

    async fn ensure_label(&self, source_id: i64, name: &str) -> StoreResult<i64>;

    /// Dedup key -> message id for keys that exist at all.
    async fn message_exists_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>>;

    /// Dedup key -> message id for keys whose raw bytes are stored and whose
    /// attachments are not pending.
    async fn message_exists_with_raw_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>>;

    /// Email -> participant id. Existing participants keep a non-empty name.
    async fn ensure_participants_batch(
        &self,
        addresses: &[Address],
    ) -> StoreResult<HashMap<String, i64>>;

    async fn ensure_conversation(
        &self,
        source_id: i64,
        thread_key: &str,
        title: &str,
    ) -> StoreResult<i64>;

    /// Atomically insert or replace a message with its bodies, raw bytes,
    /// recipients and labels. Attachments are marked pending when
    /// `attachment_count > 0`.
    async fn persist_message(&self, record: &MessageRecord) -> StoreResult<i64>;

    async fn add_message_labels(&self, message_id: i64, label_ids: &[i64]) -> StoreResult<()>;

    async fn upsert_attachment(
        &self,
        message_id: i64,
        attachment: &AttachmentRecord,
    ) -> StoreResult<()>;

    async fn mark_attachments_stored(&self, message_id: i64) -> StoreResult<()>;
}
