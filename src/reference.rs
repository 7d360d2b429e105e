//! Reference rows: the local, de-duplicated mirror of relevant raw rows.
//!
//! Classification fields are written once at insert time by the sync engine.
//! Only the evaluation path updates a row afterwards, and only its
//! evaluation fields.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, QueryBuilder, Row, Sqlite};

use crate::models::{
    date_key, parse_date_key, CategoryType, EvaluationStatus, InjectionMode, ReferenceRow,
    Selection,
};

const COLUMNS: &str = "id, source_id, owner_id, actor_id, category, injection_mode, \
     evaluation_status, evaluation_result_id, record_date, evaluated_at, created_at";

/// Fields known at first sighting of a raw row.
#[derive(Debug, Clone)]
pub struct NewReferenceRow {
    pub source_id: i64,
    pub owner_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub category: CategoryType,
    pub injection_mode: Option<InjectionMode>,
    pub record_date: Option<NaiveDate>,
}

fn from_row(row: &SqliteRow) -> Result<ReferenceRow> {
    let category: String = row.get("category");
    let mode: Option<String> = row.get("injection_mode");
    let status: String = row.get("evaluation_status");
    let record_date: Option<String> = row.get("record_date");

    Ok(ReferenceRow {
        id: row.get("id"),
        source_id: row.get("source_id"),
        owner_id: row.get("owner_id"),
        actor_id: row.get("actor_id"),
        category: category.parse()?,
        injection_mode: mode.map(|m| m.parse::<InjectionMode>()).transpose()?,
        evaluation_status: status.parse()?,
        evaluation_result_id: row.get("evaluation_result_id"),
        record_date: record_date.map(|d| parse_date_key(&d)).transpose()?,
        evaluated_at: row.get("evaluated_at"),
        created_at: row.get("created_at"),
    })
}

/// Insert unless a row with the same `source_id` exists.
///
/// Returns `true` when a new row was written, `false` on re-delivery.
pub async fn insert_if_absent<'e, E>(executor: E, row: &NewReferenceRow) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO reference_rows (source_id, owner_id, actor_id, category, injection_mode,
                                    evaluation_status, record_date, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_id) DO NOTHING
        "#,
    )
    .bind(row.source_id)
    .bind(row.owner_id)
    .bind(row.actor_id)
    .bind(row.category.as_str())
    .bind(row.injection_mode.map(|m| m.as_str()))
    .bind(EvaluationStatus::Pending.as_str())
    .bind(row.record_date.map(date_key))
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get<'e, E>(executor: E, id: i64) -> Result<Option<ReferenceRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {} FROM reference_rows WHERE id = ?", COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_source_id<'e, E>(executor: E, source_id: i64) -> Result<Option<ReferenceRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM reference_rows WHERE source_id = ?",
        COLUMNS
    ))
    .bind(source_id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn rows_for_date<'e, E>(executor: E, date: NaiveDate) -> Result<Vec<ReferenceRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM reference_rows WHERE record_date = ? ORDER BY source_id ASC",
        COLUMNS
    ))
    .bind(date_key(date))
    .fetch_all(executor)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Evaluable rows matching `selection`, ascending by id.
///
/// Always narrowed to `rag_retrieval`. Unless `force`, rows already
/// `completed` are left out.
pub async fn select_candidates<'e, E>(
    executor: E,
    selection: &Selection,
    force: bool,
) -> Result<Vec<ReferenceRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM reference_rows WHERE injection_mode = ",
        COLUMNS
    ));
    qb.push_bind(InjectionMode::RagRetrieval.as_str());

    if let Some(owner_id) = selection.owner_id {
        qb.push(" AND owner_id = ").push_bind(owner_id);
    }
    if let Some(start) = selection.start_date {
        qb.push(" AND record_date >= ").push_bind(date_key(start));
    }
    if let Some(end) = selection.end_date {
        qb.push(" AND record_date <= ").push_bind(date_key(end));
    }
    if !force {
        qb.push(" AND evaluation_status != ")
            .push_bind(EvaluationStatus::Completed.as_str());
    }
    qb.push(" ORDER BY id ASC");

    let rows = qb.build().fetch_all(executor).await?;
    rows.iter().map(from_row).collect()
}

pub async fn mark_status<'e, E>(executor: E, id: i64, status: EvaluationStatus) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE reference_rows SET evaluation_status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Point a row at its evaluation result and mark it completed.
pub async fn link_result<'e, E>(executor: E, id: i64, result_id: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE reference_rows SET evaluation_result_id = ?, evaluation_status = ?, evaluated_at = ? \
         WHERE id = ?",
    )
    .bind(result_id)
    .bind(EvaluationStatus::Completed.as_str())
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}
