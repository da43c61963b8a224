//! PostgreSQL-backed [`Store`].
//!
//! Schema lives in `migrations/`; run [`MIGRATOR`] (or [`PgStore::migrate`])
//! before use. Multi-row writes that must land together run inside one
//! transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::migrate::Migrator;

use super::{
    AttachmentRecord, MessageRecord, Source, Store, StoreResult, SyncProgress, SyncRun,
    SyncStatus,
};
use crate::mime::Address;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

type SyncRunRow = (
    i64,
    i64,
    String,
    SyncStatus,
    Option<String>,
    Option<String>,
    i64,
    i64,
    i64,
    i64,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn sync_run_from_row(row: SyncRunRow) -> SyncRun {
    let (
        id,
        source_id,
        sync_type,
        status,
        cursor,
        final_cursor,
        processed,
        added,
        updated,
        errors,
        error_message,
        started_at,
        completed_at,
    ) = row;
    SyncRun {
        id,
        source_id,
        sync_type,
        status,
        cursor,
        final_cursor,
        progress: SyncProgress {
            processed,
            added,
            updated,
            errors,
        },
        error_message,
        started_at,
        completed_at,
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_or_create_source(
        &self,
        source_type: &str,
        identifier: &str,
    ) -> StoreResult<Source> {
        let (id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO sources (source_type, identifier)
               VALUES ($1, $2)
               ON CONFLICT (source_type, identifier)
               DO UPDATE SET source_type = EXCLUDED.source_type
               RETURNING id"#,
        )
        .bind(source_type)
        .bind(identifier)
        .fetch_one(&self.pool)
        .await?;

        Ok(Source {
            id,
            source_type: source_type.to_string(),
            identifier: identifier.to_string(),
        })
    }

    async fn get_active_sync(&self, source_id: i64) -> StoreResult<Option<SyncRun>> {
        let row: Option<SyncRunRow> = sqlx::query_as(
            r#"SELECT id, source_id, sync_type, status, cursor_before, cursor_after,
                      messages_processed, messages_added, messages_updated, errors_count,
                      error_message, started_at, completed_at
               FROM sync_runs
               WHERE source_id = $1 AND status = 'running'
               ORDER BY started_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(sync_run_from_row))
    }

    async fn start_sync(&self, source_id: i64, sync_type: &str) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"UPDATE sync_runs
               SET status = 'failed', error_message = 'superseded by new sync', completed_at = NOW()
               WHERE source_id = $1 AND status = 'running'"#,
        )
        .bind(source_id)
        .execute(&mut *tx)
        .await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO sync_runs (source_id, sync_type, status)
               VALUES ($1, $2, 'running')
               RETURNING id"#,
        )
        .bind(source_id)
        .bind(sync_type)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn update_sync_checkpoint(
        &self,
        sync_id: i64,
        cursor: &str,
        progress: &SyncProgress,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE sync_runs
               SET cursor_before = $2, messages_processed = $3, messages_added = $4,
                   messages_updated = $5, errors_count = $6
               WHERE id = $1"#,
        )
        .bind(sync_id)
        .bind(cursor)
        .bind(progress.processed)
        .bind(progress.added)
        .bind(progress.updated)
        .bind(progress.errors)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_sync(&self, sync_id: i64, final_cursor: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_runs SET status = 'completed', cursor_after = $2, completed_at = NOW() WHERE id = $1",
        )
        .bind(sync_id)
        .bind(final_cursor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_sync(&self, sync_id: i64, message: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_runs SET status = 'failed', error_message = $2, completed_at = NOW() WHERE id = $1",
        )
        .bind(sync_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_label(&self, source_id: i64, name: &str) -> StoreResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO labels (source_id, name)
               VALUES ($1, $2)
               ON CONFLICT (source_id, name) DO UPDATE SET name = EXCLUDED.name
               RETURNING id"#,
        )
        .bind(source_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn message_exists_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT source_message_id, id FROM messages
               WHERE source_id = $1 AND source_message_id = ANY($2)"#,
        )
        .bind(source_id)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn message_exists_with_raw_batch(
        &self,
        source_id: i64,
        keys: &[String],
    ) -> StoreResult<HashMap<String, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT m.source_message_id, m.id
               FROM messages m
               JOIN message_raw r ON r.message_id = m.id
               WHERE m.source_id = $1
                 AND m.source_message_id = ANY($2)
                 AND NOT m.attachments_pending"#,
        )
        .bind(source_id)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn ensure_participants_batch(
        &self,
        addresses: &[Address],
    ) -> StoreResult<HashMap<String, i64>> {
        let mut ids = HashMap::new();
        if addresses.is_empty() {
            return Ok(ids);
        }

        let mut tx = self.pool.begin().await?;
        for address in addresses.iter().filter(|a| !a.email.is_empty()) {
            if ids.contains_key(&address.email) {
                continue;
            }
            let (id,): (i64,) = sqlx::query_as(
                r#"INSERT INTO participants (email, display_name, domain)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (email) DO UPDATE SET display_name =
                       CASE WHEN participants.display_name = '' THEN EXCLUDED.display_name
                            ELSE participants.display_name END
                   RETURNING id"#,
            )
            .bind(&address.email)
            .bind(&address.name)
            .bind(&address.domain)
            .fetch_one(&mut *tx)
            .await?;
            ids.insert(address.email.clone(), id);
        }
        tx.commit().await?;

        Ok(ids)
    }

    async fn ensure_conversation(
        &self,
        source_id: i64,
        thread_key: &str,
        title: &str,
    ) -> StoreResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO conversations (source_id, thread_key, title)
               VALUES ($1, $2, $3)
               ON CONFLICT (source_id, thread_key) DO UPDATE SET thread_key = EXCLUDED.thread_key
               RETURNING id"#,
        )
        .bind(source_id)
        .bind(thread_key)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn persist_message(&self, record: &MessageRecord) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;

        let (message_id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO messages (
                   source_id, source_message_id, conversation_id, message_id_header,
                   subject, snippet, sent_at, sender_id, is_from_me, size_estimate,
                   attachment_count, attachments_pending
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (source_id, source_message_id) DO UPDATE SET
                   conversation_id = EXCLUDED.conversation_id,
                   message_id_header = EXCLUDED.message_id_header,
                   subject = EXCLUDED.subject,
                   snippet = EXCLUDED.snippet,
                   sent_at = EXCLUDED.sent_at,
                   sender_id = EXCLUDED.sender_id,
                   is_from_me = EXCLUDED.is_from_me,
                   size_estimate = EXCLUDED.size_estimate,
                   attachment_count = EXCLUDED.attachment_count,
                   attachments_pending = EXCLUDED.attachments_pending,
                   updated_at = NOW()
               RETURNING id"#,
        )
        .bind(record.source_id)
        .bind(&record.source_message_id)
        .bind(record.conversation_id)
        .bind(&record.message_id_header)
        .bind(&record.subject)
        .bind(&record.snippet)
        .bind(record.sent_at)
        .bind(record.sender_id)
        .bind(record.is_from_me)
        .bind(record.size_estimate)
        .bind(record.attachment_count)
        .bind(record.attachment_count > 0)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO message_bodies (message_id, body_text, body_html)
               VALUES ($1, $2, $3)
               ON CONFLICT (message_id) DO UPDATE SET
                   body_text = EXCLUDED.body_text, body_html = EXCLUDED.body_html"#,
        )
        .bind(message_id)
        .bind(&record.body_text)
        .bind(&record.body_html)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO message_raw (message_id, raw_data, raw_hash)
               VALUES ($1, $2, $3)
               ON CONFLICT (message_id) DO UPDATE SET
                   raw_data = EXCLUDED.raw_data, raw_hash = EXCLUDED.raw_hash"#,
        )
        .bind(message_id)
        .bind(&record.raw)
        .bind(&record.raw_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM message_recipients WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        for recipient in &record.recipients {
            sqlx::query(
                r#"INSERT INTO message_recipients (message_id, participant_id, recipient_type, display_name)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT DO NOTHING"#,
            )
            .bind(message_id)
            .bind(recipient.participant_id)
            .bind(recipient.kind.as_str())
            .bind(&recipient.display_name)
            .execute(&mut *tx)
            .await?;
        }

        if !record.label_ids.is_empty() {
            sqlx::query(
                r#"INSERT INTO message_labels (message_id, label_id)
                   SELECT $1, UNNEST($2::BIGINT[])
                   ON CONFLICT DO NOTHING"#,
            )
            .bind(message_id)
            .bind(&record.label_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(message_id)
    }

    async fn add_message_labels(&self, message_id: i64, label_ids: &[i64]) -> StoreResult<()> {
        if label_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"INSERT INTO message_labels (message_id, label_id)
               SELECT $1, UNNEST($2::BIGINT[])
               ON CONFLICT DO NOTHING"#,
        )
        .bind(message_id)
        .bind(label_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_attachment(
        &self,
        message_id: i64,
        attachment: &AttachmentRecord,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO attachments (message_id, filename, content_type, storage_path, content_hash, size)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (message_id, content_hash) DO UPDATE SET
                   filename = EXCLUDED.filename,
                   content_type = EXCLUDED.content_type,
                   storage_path = EXCLUDED.storage_path,
                   size = EXCLUDED.size"#,
        )
        .bind(message_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(&attachment.storage_path)
        .bind(&attachment.content_hash)
        .bind(attachment.size)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_attachments_stored(&self, message_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE messages SET attachments_pending = FALSE WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
