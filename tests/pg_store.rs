mod common;

use archive_importer::store::SyncStatus;
use archive_importer::test_support::{TestDatabase, TestDatabaseError};
use archive_importer::{PgStore, Store};
use tempfile::TempDir;

use common::{OWNER, mbox, options, write_file};

async fn provision() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping postgres store test: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

#[tokio::test]
async fn mbox_import_round_trips_through_postgres() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());
    let dir = TempDir::new().expect("tempdir");
    let content = mbox(&["alpha", "beta"]);
    let inbox = write_file(&dir.path().join("Inbox.mbox"), &content);
    let archive = write_file(&dir.path().join("Archive.mbox"), &content);

    let mut opts = options(&dir.path().join("att"));
    opts.label = Some("Inbox".to_string());
    let first = common::import_mbox(&store, &inbox, &opts).await;
    assert_eq!(first.added, 2);

    opts.label = Some("Archive".to_string());
    let second = common::import_mbox(&store, &archive, &opts).await;
    assert_eq!(second.added, 0);
    assert_eq!(second.skipped, 2);

    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(store.pool())
        .await
        .expect("count messages");
    assert_eq!(messages, 2);

    let labels: Vec<(String,)> = sqlx::query_as(
        r#"SELECT l.name
           FROM message_labels ml
           JOIN labels l ON l.id = ml.label_id
           JOIN messages m ON m.id = ml.message_id
           WHERE m.subject = 'alpha'
           ORDER BY l.name"#,
    )
    .fetch_all(store.pool())
    .await
    .expect("labels");
    let labels: Vec<String> = labels.into_iter().map(|(name,)| name).collect();
    assert_eq!(labels, ["Archive", "Inbox"]);

    let (raw_len, recipients): (i32, i64) = sqlx::query_as(
        r#"SELECT LENGTH(r.raw_data),
                  (SELECT COUNT(*) FROM message_recipients mr WHERE mr.message_id = m.id)
           FROM messages m
           JOIN message_raw r ON r.message_id = m.id
           WHERE m.subject = 'beta'"#,
    )
    .fetch_one(store.pool())
    .await
    .expect("raw row");
    assert!(raw_len > 0);
    assert_eq!(recipients, 2);

    let source = store
        .get_or_create_source("mbox", OWNER)
        .await
        .expect("source");
    assert!(
        store
            .get_active_sync(source.id)
            .await
            .expect("active sync")
            .is_none()
    );

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn starting_a_sync_supersedes_the_running_one() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());
    let source = store
        .get_or_create_source("mbox", OWNER)
        .await
        .expect("source");

    let first = store
        .start_sync(source.id, "import-mbox")
        .await
        .expect("first sync");
    let progress = archive_importer::store::SyncProgress {
        processed: 3,
        added: 2,
        updated: 1,
        errors: 0,
    };
    store
        .update_sync_checkpoint(first, r#"{"file":"/tmp/a.mbox","offset":42}"#, &progress)
        .await
        .expect("checkpoint");

    let active = store
        .get_active_sync(source.id)
        .await
        .expect("active sync")
        .expect("running run");
    assert_eq!(active.id, first);
    assert_eq!(active.progress, progress);
    assert_eq!(
        active.cursor.as_deref(),
        Some(r#"{"file":"/tmp/a.mbox","offset":42}"#)
    );

    let second = store
        .start_sync(source.id, "import-mbox")
        .await
        .expect("second sync");
    let (status, message): (SyncStatus, Option<String>) =
        sqlx::query_as("SELECT status, error_message FROM sync_runs WHERE id = $1")
            .bind(first)
            .fetch_one(store.pool())
            .await
            .expect("first run");
    assert_eq!(status, SyncStatus::Failed);
    assert_eq!(message.as_deref(), Some("superseded by new sync"));

    store
        .complete_sync(second, "offset:42")
        .await
        .expect("complete");
    assert!(
        store
            .get_active_sync(source.id)
            .await
            .expect("active sync")
            .is_none()
    );

    test_db.close().await.expect("failed to drop test database");
}
