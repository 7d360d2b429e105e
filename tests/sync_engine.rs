//! Integration tests for the sync engine: cursor handling, de-duplication,
//! counter upserts, and the recompute pass.

mod common;

use common::{count, day, kb_row, selected_row, setup};
use std::sync::Arc;
use usage_ledger::aggregate;
use usage_ledger::checkpoint;
use usage_ledger::models::{CheckpointStatus, InjectionMode};
use usage_ledger::payload::OwnerMetadata;
use usage_ledger::raw_source::{InMemoryRawSource, RawSource, UnconfiguredRawSource};
use usage_ledger::reference;
use usage_ledger::sync::{SyncEngine, SyncStatus};

fn engine_with(
    pool: &sqlx::SqlitePool,
    cfg: &usage_ledger::config::Config,
    raw: &Arc<InMemoryRawSource>,
) -> SyncEngine {
    let raw: Arc<dyn RawSource> = raw.clone();
    SyncEngine::new(pool.clone(), raw, cfg)
}

fn five_rows(raw: &InMemoryRawSource) {
    raw.push_row(kb_row(1, "rag_retrieval", 7, 1, "2024-01-01 09:05"));
    raw.push_row(kb_row(2, "direct_injection", 7, 2, "2024-01-01 09:30"));
    raw.push_row(selected_row(3, 9, 1, "2024-01-01 10:00"));
    raw.push_row(kb_row(4, "rag_retrieval", 8, 3, "2024-01-01 11:10"));
    raw.push_row(kb_row(5, "rag_retrieval", 7, 2, "2024-01-01 11:20"));
}

#[tokio::test]
async fn test_concrete_batch_from_cursor_100() {
    let (_tmp, cfg, pool) = setup("").await;
    checkpoint::record_success(&pool, "incremental", 100, 0)
        .await
        .unwrap();

    let raw = Arc::new(InMemoryRawSource::new());
    raw.push_row(kb_row(101, "rag_retrieval", 7, 1, "2024-01-01 10:15"));
    raw.push_row(selected_row(102, 9, 1, "2024-01-01 10:45"));

    let engine = engine_with(&pool, &cfg, &raw);
    let report = engine.run_incremental().await.unwrap();

    assert_eq!(report.status, SyncStatus::Success);
    assert_eq!(report.rows_synced, 2);
    assert_eq!(report.rows_skipped, 0);
    assert_eq!(report.new_cursor, 102);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reference_rows").await, 2);

    let date = day("2024-01-01");
    let hourly = aggregate::hourly_for_date(&pool, date).await.unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].hour, 10);
    assert_eq!(hourly[0].total, 2);
    assert_eq!(hourly[0].counts.rag_retrieval, 1);
    assert_eq!(hourly[0].counts.direct_injection, 0);
    assert_eq!(hourly[0].counts.selected_documents, 1);

    let daily = aggregate::daily(&pool, date).await.unwrap().unwrap();
    assert_eq!(daily.total, 2);

    assert_eq!(checkpoint::cursor(&pool, "incremental").await.unwrap(), 102);

    let rag = reference::get_by_source_id(&pool, 101).await.unwrap().unwrap();
    assert_eq!(rag.injection_mode, Some(InjectionMode::RagRetrieval));
    assert_eq!(rag.owner_id, Some(7));
    let selected = reference::get_by_source_id(&pool, 102).await.unwrap().unwrap();
    assert_eq!(selected.injection_mode, Some(InjectionMode::SelectedDocuments));
    assert_eq!(selected.owner_id, Some(9));
}

#[tokio::test]
async fn test_second_run_without_new_rows_is_a_noop() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    five_rows(&raw);
    let engine = engine_with(&pool, &cfg, &raw);

    let first = engine.run_incremental().await.unwrap();
    assert_eq!(first.rows_synced, 5);
    let before = aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap();

    let second = engine.run_incremental().await.unwrap();
    assert_eq!(second.status, SyncStatus::Success);
    assert_eq!(second.rows_synced, 0);
    assert_eq!(second.new_cursor, 5);

    let after = aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap();
    assert_eq!(before.total, after.total);
    assert_eq!(before.counts, after.counts);
}

#[tokio::test]
async fn test_redelivered_rows_are_skipped_not_recounted() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    five_rows(&raw);
    let engine = engine_with(&pool, &cfg, &raw);

    engine.run_incremental().await.unwrap();
    let date = day("2024-01-01");
    let before = aggregate::daily(&pool, date).await.unwrap().unwrap();
    let hourly_before = aggregate::hourly_for_date(&pool, date).await.unwrap();

    // Simulate a crash between insert and checkpoint write.
    sqlx::query("UPDATE sync_checkpoints SET last_cursor = 2 WHERE channel = 'incremental'")
        .execute(&pool)
        .await
        .unwrap();

    let report = engine.run_incremental().await.unwrap();
    assert_eq!(report.status, SyncStatus::Success);
    assert_eq!(report.rows_synced, 0);
    assert_eq!(report.rows_skipped, 3);
    assert_eq!(report.new_cursor, 5);

    let after = aggregate::daily(&pool, date).await.unwrap().unwrap();
    assert_eq!(before.total, after.total);
    assert_eq!(before.counts, after.counts);
    assert_eq!(
        hourly_before,
        aggregate::hourly_for_date(&pool, date).await.unwrap()
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reference_rows").await, 5);
}

#[tokio::test]
async fn test_failed_fetch_leaves_cursor_and_records_error() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    raw.push_row(kb_row(1, "rag_retrieval", 7, 1, "2024-01-01 09:05"));
    let engine = engine_with(&pool, &cfg, &raw);
    engine.run_incremental().await.unwrap();

    raw.push_row(kb_row(2, "rag_retrieval", 7, 1, "2024-01-01 09:06"));
    raw.fail_next_cursor_read("connection reset by peer");

    let failed = engine.run_incremental().await.unwrap();
    assert_eq!(failed.status, SyncStatus::Failed);
    assert_eq!(failed.new_cursor, 1);
    assert!(failed.error.as_deref().unwrap().contains("connection reset"));

    let cp = checkpoint::get(&pool, "incremental").await.unwrap().unwrap();
    assert_eq!(cp.last_cursor, 1);
    assert_eq!(cp.last_status, Some(CheckpointStatus::Failed));
    assert!(cp.last_error.unwrap().contains("connection reset"));

    let retry = engine.run_incremental().await.unwrap();
    assert_eq!(retry.status, SyncStatus::Success);
    assert_eq!(retry.rows_synced, 1);
    assert_eq!(retry.new_cursor, 2);
    let cp = checkpoint::get(&pool, "incremental").await.unwrap().unwrap();
    assert_eq!(cp.last_status, Some(CheckpointStatus::Success));
    assert!(cp.last_error.is_none());
}

#[tokio::test]
async fn test_write_failure_inside_batch_rolls_back_everything() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    raw.push_row(kb_row(1, "rag_retrieval", 7, 1, "2024-01-01 09:05"));
    raw.push_row(kb_row(2, "direct_injection", 7, 2, "2024-01-01 09:30"));
    let engine = engine_with(&pool, &cfg, &raw);
    engine.run_incremental().await.unwrap();

    let first_day = aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap();
    let hourly_rows = count(&pool, "SELECT COUNT(*) FROM hourly_counters").await;
    let owner_rows = count(&pool, "SELECT COUNT(*) FROM owner_daily_counters").await;

    raw.push_row(kb_row(3, "rag_retrieval", 8, 3, "2024-01-02 08:00"));
    raw.push_row(selected_row(4, 9, 1, "2024-01-02 08:30"));
    sqlx::query(
        "CREATE TRIGGER reject_hourly BEFORE INSERT ON hourly_counters \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    let failed = engine.run_incremental().await.unwrap();
    assert_eq!(failed.status, SyncStatus::Failed);
    assert_eq!(failed.new_cursor, 2);
    assert!(failed.error.as_deref().unwrap().contains("disk I/O error"));

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM reference_rows").await, 2);
    assert!(reference::get_by_source_id(&pool, 3).await.unwrap().is_none());
    assert!(aggregate::daily(&pool, day("2024-01-02")).await.unwrap().is_none());
    assert_eq!(
        aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap(),
        first_day
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM hourly_counters").await, hourly_rows);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM owner_daily_counters").await, owner_rows);

    let cp = checkpoint::get(&pool, "incremental").await.unwrap().unwrap();
    assert_eq!(cp.last_cursor, 2);
    assert_eq!(cp.last_status, Some(CheckpointStatus::Failed));

    sqlx::query("DROP TRIGGER reject_hourly")
        .execute(&pool)
        .await
        .unwrap();
    let retry = engine.run_incremental().await.unwrap();
    assert_eq!(retry.status, SyncStatus::Success);
    assert_eq!(retry.rows_synced, 2);
    assert_eq!(retry.new_cursor, 4);
    let second_day = aggregate::daily(&pool, day("2024-01-02")).await.unwrap().unwrap();
    assert_eq!(second_day.total, 2);
}

#[tokio::test]
async fn test_odd_payload_fields_still_classify() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    let mut row = kb_row(1, "rag_retrieval", 7, 1, "2024-01-01 09:05");
    row.payload = serde_json::json!({
        "ragResult": {"injectionMode": "rag_retrieval", "chunks": null, "query": 42},
        "knowledgeId": "7"
    });
    raw.push_row(row);
    engine_with(&pool, &cfg, &raw).run_incremental().await.unwrap();

    let stored = reference::get_by_source_id(&pool, 1).await.unwrap().unwrap();
    assert_eq!(stored.injection_mode, Some(InjectionMode::RagRetrieval));
    assert_eq!(stored.owner_id, Some(7));
    let daily = aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap();
    assert_eq!(daily.counts.rag_retrieval, 1);
}

#[tokio::test]
async fn test_cursor_is_monotonic_across_pages() {
    let (_tmp, cfg, pool) = setup("[raw_source]\npage_size = 2").await;
    let raw = Arc::new(InMemoryRawSource::new());
    five_rows(&raw);
    let engine = engine_with(&pool, &cfg, &raw);

    let mut cursors = Vec::new();
    for _ in 0..4 {
        let report = engine.run_incremental().await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        cursors.push(report.new_cursor);
    }
    assert_eq!(cursors, vec![2, 4, 5, 5]);

    // A lower cursor from a stale success write never wins.
    checkpoint::record_success(&pool, "incremental", 3, 0)
        .await
        .unwrap();
    assert_eq!(checkpoint::cursor(&pool, "incremental").await.unwrap(), 5);

    let daily = aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap();
    assert_eq!(daily.total, 5);
}

#[tokio::test]
async fn test_daily_total_matches_mode_sum() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    five_rows(&raw);
    raw.push_row(kb_row(6, "something_new", 7, 4, "2024-01-01 12:00"));
    let engine = engine_with(&pool, &cfg, &raw);
    engine.run_incremental().await.unwrap();

    let daily = aggregate::daily(&pool, day("2024-01-01")).await.unwrap().unwrap();
    assert_eq!(
        daily.total,
        daily.counts.rag_retrieval + daily.counts.direct_injection + daily.counts.selected_documents
    );
    assert_eq!(daily.total, 5);
    assert_eq!(daily.counts.rag_retrieval, 3);
    assert_eq!(daily.active_owners, 3);
    assert_eq!(daily.active_actors, 4);

    let unknown = reference::get_by_source_id(&pool, 6).await.unwrap().unwrap();
    assert_eq!(unknown.injection_mode, None);

    for hour in aggregate::hourly_for_date(&pool, day("2024-01-01")).await.unwrap() {
        assert_eq!(hour.total, hour.counts.total());
    }
}

#[tokio::test]
async fn test_recompute_overwrites_drifted_daily_counter() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    five_rows(&raw);
    raw.set_owner(OwnerMetadata {
        owner_id: 7,
        display_name: Some("handbook".to_string()),
        namespace: Some("default".to_string()),
        ..Default::default()
    });
    let engine = engine_with(&pool, &cfg, &raw);
    engine.run_incremental().await.unwrap();

    let date = day("2024-01-01");
    let owners = aggregate::owner_daily_for_date(&pool, date).await.unwrap();
    let seven = owners.iter().find(|o| o.owner_id == 7).unwrap();
    assert_eq!(seven.display_name.as_deref(), Some("handbook"));

    sqlx::query(
        "UPDATE daily_counters SET total = 99, rag_retrieval = 50, active_owners = 40 WHERE date = '2024-01-01'",
    )
    .execute(&pool)
    .await
    .unwrap();
    let hourly_before = aggregate::hourly_for_date(&pool, date).await.unwrap();

    raw.set_owner(OwnerMetadata {
        owner_id: 7,
        display_name: Some("handbook-v2".to_string()),
        namespace: Some("team-a".to_string()),
        ..Default::default()
    });

    let report = engine.run_recompute(Some(date)).await.unwrap();
    assert_eq!(report.status, SyncStatus::Success);
    assert_eq!(report.rows_scanned, 5);
    assert_eq!(report.owners_refreshed, 1);

    let daily = aggregate::daily(&pool, date).await.unwrap().unwrap();
    assert_eq!(daily.total, 5);
    assert_eq!(daily.counts.rag_retrieval, 3);
    assert_eq!(daily.counts.direct_injection, 1);
    assert_eq!(daily.counts.selected_documents, 1);
    assert_eq!(daily.active_owners, 3);
    assert_eq!(daily.active_actors, 3);

    let owners = aggregate::owner_daily_for_date(&pool, date).await.unwrap();
    let seven = owners.iter().find(|o| o.owner_id == 7).unwrap();
    assert_eq!(seven.display_name.as_deref(), Some("handbook-v2"));
    assert_eq!(seven.namespace.as_deref(), Some("team-a"));
    assert_eq!(seven.total, 3);

    // Hourly counters are a live view and are not reconciled.
    assert_eq!(
        hourly_before,
        aggregate::hourly_for_date(&pool, date).await.unwrap()
    );

    let cp = checkpoint::get(&pool, "recompute").await.unwrap().unwrap();
    assert_eq!(cp.last_status, Some(CheckpointStatus::Success));
    assert_eq!(cp.rows_processed, 5);
}

#[tokio::test]
async fn test_recompute_keeps_counter_fix_when_owner_read_fails() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    five_rows(&raw);
    raw.set_owner(OwnerMetadata {
        owner_id: 7,
        display_name: Some("handbook".to_string()),
        ..Default::default()
    });
    let engine = engine_with(&pool, &cfg, &raw);
    engine.run_incremental().await.unwrap();

    let date = day("2024-01-01");
    sqlx::query("UPDATE daily_counters SET total = 99 WHERE date = '2024-01-01'")
        .execute(&pool)
        .await
        .unwrap();
    raw.fail_owner_metadata(Some("kinds table unreachable"));

    let report = engine.run_recompute(Some(date)).await.unwrap();
    assert_eq!(report.status, SyncStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("kinds table unreachable"));
    assert_eq!(report.total, 5);
    assert_eq!(report.owners_refreshed, 0);

    let daily = aggregate::daily(&pool, date).await.unwrap().unwrap();
    assert_eq!(daily.total, 5);

    let owners = aggregate::owner_daily_for_date(&pool, date).await.unwrap();
    let seven = owners.iter().find(|o| o.owner_id == 7).unwrap();
    assert_eq!(seven.display_name.as_deref(), Some("handbook"));

    let cp = checkpoint::get(&pool, "recompute").await.unwrap().unwrap();
    assert_eq!(cp.last_status, Some(CheckpointStatus::Failed));
    assert!(cp.last_error.unwrap().contains("kinds table unreachable"));

    raw.fail_owner_metadata(None);
    let retry = engine.run_recompute(Some(date)).await.unwrap();
    assert_eq!(retry.status, SyncStatus::Success);
    assert_eq!(retry.owners_refreshed, 1);
    let cp = checkpoint::get(&pool, "recompute").await.unwrap().unwrap();
    assert_eq!(cp.last_status, Some(CheckpointStatus::Success));
}

#[tokio::test]
async fn test_recompute_of_empty_day_writes_zeros() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    let engine = engine_with(&pool, &cfg, &raw);

    let date = day("2024-02-02");
    let report = engine.run_recompute(Some(date)).await.unwrap();
    assert_eq!(report.status, SyncStatus::Success);
    assert_eq!(report.rows_scanned, 0);

    let daily = aggregate::daily(&pool, date).await.unwrap().unwrap();
    assert_eq!(daily.total, 0);
}

#[tokio::test]
async fn test_unconfigured_raw_source_skips() {
    let (_tmp, cfg, pool) = setup("").await;
    let engine = SyncEngine::new(pool.clone(), Arc::new(UnconfiguredRawSource), &cfg);

    let report = engine.run_incremental().await.unwrap();
    assert_eq!(report.status, SyncStatus::Skipped);
    assert_eq!(report.rows_synced, 0);
    assert!(checkpoint::get(&pool, "incremental").await.unwrap().is_none());

    let recompute = engine.run_recompute(None).await.unwrap();
    assert_eq!(recompute.status, SyncStatus::Skipped);

    let status = engine.sync_status().await.unwrap();
    assert!(!status.raw_source_configured);
    assert!(status.incremental.is_none());
    assert!(status.recompute.is_none());
}

#[tokio::test]
async fn test_empty_batch_records_success_without_moving_cursor() {
    let (_tmp, cfg, pool) = setup("").await;
    let raw = Arc::new(InMemoryRawSource::new());
    let engine = engine_with(&pool, &cfg, &raw);

    let report = engine.run_incremental().await.unwrap();
    assert_eq!(report.status, SyncStatus::Success);
    assert_eq!(report.new_cursor, 0);

    let status = engine.sync_status().await.unwrap();
    assert!(status.raw_source_configured);
    let cp = status.incremental.unwrap();
    assert_eq!(cp.last_cursor, 0);
    assert_eq!(cp.last_status, Some(CheckpointStatus::Success));
}
