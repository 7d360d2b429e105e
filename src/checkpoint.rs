//! Durable per-channel sync watermarks.
//!
//! One row per channel, overwritten on every run attempt. Success writes
//! keep `last_cursor` non-decreasing (`MAX(old, new)`); failure writes never
//! touch it.

use anyhow::Result;
use sqlx::{Executor, Row, Sqlite};

use crate::models::{CheckpointStatus, SyncCheckpoint};

pub async fn get<'e, E>(executor: E, channel: &str) -> Result<Option<SyncCheckpoint>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT channel, last_cursor, last_run_at, last_status, last_error, rows_processed \
         FROM sync_checkpoints WHERE channel = ?",
    )
    .bind(channel)
    .fetch_optional(executor)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status: Option<String> = row.get("last_status");
    Ok(Some(SyncCheckpoint {
        channel: row.get("channel"),
        last_cursor: row.get("last_cursor"),
        last_run_at: row.get("last_run_at"),
        last_status: status.map(|s| s.parse::<CheckpointStatus>()).transpose()?,
        last_error: row.get("last_error"),
        rows_processed: row.get("rows_processed"),
    }))
}

/// Current cursor for a channel, `0` if it has never run.
pub async fn cursor<'e, E>(executor: E, channel: &str) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let cursor: Option<i64> =
        sqlx::query_scalar("SELECT last_cursor FROM sync_checkpoints WHERE channel = ?")
            .bind(channel)
            .fetch_optional(executor)
            .await?;
    Ok(cursor.unwrap_or(0))
}

pub async fn record_success<'e, E>(
    executor: E,
    channel: &str,
    cursor: i64,
    rows_processed: i64,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO sync_checkpoints (channel, last_cursor, last_run_at, last_status, last_error, rows_processed)
        VALUES (?, ?, ?, ?, NULL, ?)
        ON CONFLICT(channel) DO UPDATE SET
            last_cursor = MAX(sync_checkpoints.last_cursor, excluded.last_cursor),
            last_run_at = excluded.last_run_at,
            last_status = excluded.last_status,
            last_error = NULL,
            rows_processed = excluded.rows_processed
        "#,
    )
    .bind(channel)
    .bind(cursor)
    .bind(now)
    .bind(CheckpointStatus::Success.as_str())
    .bind(rows_processed)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn record_failure<'e, E>(executor: E, channel: &str, error: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO sync_checkpoints (channel, last_cursor, last_run_at, last_status, last_error, rows_processed)
        VALUES (?, 0, ?, ?, ?, 0)
        ON CONFLICT(channel) DO UPDATE SET
            last_run_at = excluded.last_run_at,
            last_status = excluded.last_status,
            last_error = excluded.last_error,
            rows_processed = 0
        "#,
    )
    .bind(channel)
    .bind(now)
    .bind(CheckpointStatus::Failed.as_str())
    .bind(truncate_error(error))
    .execute(executor)
    .await?;

    Ok(())
}

fn truncate_error(error: &str) -> String {
    const MAX_CHARS: usize = 1000;
    error.chars().take(MAX_CHARS).collect()
}
