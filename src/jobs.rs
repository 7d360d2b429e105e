//! Durable evaluation job ledger.
//!
//! Jobs live in `evaluation_jobs` so any process can read their progress.
//! State machine: `started → running → completed`. Row outcomes are counted
//! with a guarded increment, so `completed + failed + skipped` can never
//! exceed `total` even if a row is reported twice. Entering `running` zeroes
//! the counts, so a job left `running` or `failed` by an interrupted process
//! is counted afresh when it is executed again.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};
use uuid::Uuid;

use crate::models::{EvaluationJob, EvaluationStatus, JobStatus, Selection};

/// Create a `started` job over `row_ids` and return it.
pub async fn create<'e, E>(
    executor: E,
    row_ids: &[i64],
    selection: &Selection,
    force: bool,
) -> Result<EvaluationJob>
where
    E: Executor<'e, Database = Sqlite>,
{
    let job = EvaluationJob {
        job_id: Uuid::new_v4().to_string(),
        status: JobStatus::Started,
        total: row_ids.len() as i64,
        completed: 0,
        failed: 0,
        skipped: 0,
        row_ids: row_ids.to_vec(),
        selection: selection.clone(),
        force,
        created_at: chrono::Utc::now().timestamp(),
        updated_at: chrono::Utc::now().timestamp(),
    };

    sqlx::query(
        r#"
        INSERT INTO evaluation_jobs (job_id, status, total, completed, failed, skipped,
                                     row_ids, selection, force, created_at, updated_at)
        VALUES (?, ?, ?, 0, 0, 0, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.job_id)
    .bind(job.status.as_str())
    .bind(job.total)
    .bind(serde_json::to_string(&job.row_ids)?)
    .bind(serde_json::to_string(&job.selection)?)
    .bind(force)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await?;

    Ok(job)
}

fn from_row(row: &SqliteRow) -> Result<EvaluationJob> {
    let status: String = row.get("status");
    let row_ids: String = row.get("row_ids");
    let selection: String = row.get("selection");

    Ok(EvaluationJob {
        job_id: row.get("job_id"),
        status: status.parse()?,
        total: row.get("total"),
        completed: row.get("completed"),
        failed: row.get("failed"),
        skipped: row.get("skipped"),
        row_ids: serde_json::from_str(&row_ids).context("Invalid stored row_ids")?,
        selection: serde_json::from_str(&selection).context("Invalid stored selection")?,
        force: row.get("force"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn get<'e, E>(executor: E, job_id: &str) -> Result<Option<EvaluationJob>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM evaluation_jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Most recent jobs first.
pub async fn recent<'e, E>(executor: E, limit: i64) -> Result<Vec<EvaluationJob>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM evaluation_jobs ORDER BY created_at DESC, job_id LIMIT ?")
        .bind(limit)
        .fetch_all(executor)
        .await?;
    rows.iter().map(from_row).collect()
}

pub async fn set_status<'e, E>(executor: E, job_id: &str, status: JobStatus) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE evaluation_jobs SET status = ?, updated_at = ? WHERE job_id = ?")
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(job_id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        bail!("Unknown evaluation job: {}", job_id);
    }
    Ok(())
}

/// Move a job to `running` with zeroed outcome counts.
pub async fn begin_run<'e, E>(executor: E, job_id: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE evaluation_jobs
        SET status = ?, completed = 0, failed = 0, skipped = 0, updated_at = ?
        WHERE job_id = ?
        "#,
    )
    .bind(JobStatus::Running.as_str())
    .bind(chrono::Utc::now().timestamp())
    .bind(job_id)
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        bail!("Unknown evaluation job: {}", job_id);
    }
    Ok(())
}

/// Count one row's terminal outcome against the job.
///
/// Returns `false` when the job is already fully counted and the
/// increment was refused.
pub async fn record_outcome<'e, E>(
    executor: E,
    job_id: &str,
    outcome: EvaluationStatus,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let column = match outcome {
        EvaluationStatus::Completed => "completed",
        EvaluationStatus::Failed => "failed",
        EvaluationStatus::Skipped => "skipped",
        EvaluationStatus::Pending => bail!("pending is not a terminal row outcome"),
    };

    let result = sqlx::query(&format!(
        "UPDATE evaluation_jobs SET {col} = {col} + 1, updated_at = ? \
         WHERE job_id = ? AND completed + failed + skipped < total",
        col = column
    ))
    .bind(chrono::Utc::now().timestamp())
    .bind(job_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}
