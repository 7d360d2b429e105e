//! Time- and owner-bucketed usage counters.
//!
//! Two write paths touch the same tables and are kept as separate
//! operations:
//!
//! | Operation | Semantics | Caller |
//! |-----------|-----------|--------|
//! | [`accumulate_hourly`] / [`accumulate_daily`] / [`accumulate_owner_daily`] | add a delta | incremental sync |
//! | [`replace_daily`] | overwrite with a full tally | recompute |
//! | [`refresh_owner_snapshot`] | overwrite cached display fields | recompute |
//!
//! Every write is one `INSERT .. ON CONFLICT DO UPDATE` statement and
//! stores `total` as the sum of the three tracked modes.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

use crate::models::{
    date_key, parse_date_key, DailyCounter, HourlyCounter, ModeCounts, OwnerDailyCounter,
};

/// A day's counts plus its distinct owner and actor counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyTally {
    pub counts: ModeCounts,
    pub active_owners: i64,
    pub active_actors: i64,
}

pub async fn accumulate_hourly<'e, E>(
    executor: E,
    date: NaiveDate,
    hour: u32,
    delta: &ModeCounts,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO hourly_counters (date, hour, total, rag_retrieval, direct_injection,
                                     selected_documents, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date, hour) DO UPDATE SET
            total = hourly_counters.total + excluded.total,
            rag_retrieval = hourly_counters.rag_retrieval + excluded.rag_retrieval,
            direct_injection = hourly_counters.direct_injection + excluded.direct_injection,
            selected_documents = hourly_counters.selected_documents + excluded.selected_documents,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(date_key(date))
    .bind(hour as i64)
    .bind(delta.total())
    .bind(delta.rag_retrieval)
    .bind(delta.direct_injection)
    .bind(delta.selected_documents)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Add a batch's counts to a day.
///
/// Distinct owner/actor counts cannot be summed across batches; the stored
/// value becomes the larger of the two and stays provisional until the
/// day is recomputed.
pub async fn accumulate_daily<'e, E>(executor: E, date: NaiveDate, delta: &DailyTally) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO daily_counters (date, total, rag_retrieval, direct_injection, selected_documents,
                                    active_owners, active_actors, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date) DO UPDATE SET
            total = daily_counters.total + excluded.total,
            rag_retrieval = daily_counters.rag_retrieval + excluded.rag_retrieval,
            direct_injection = daily_counters.direct_injection + excluded.direct_injection,
            selected_documents = daily_counters.selected_documents + excluded.selected_documents,
            active_owners = MAX(daily_counters.active_owners, excluded.active_owners),
            active_actors = MAX(daily_counters.active_actors, excluded.active_actors),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(date_key(date))
    .bind(delta.counts.total())
    .bind(delta.counts.rag_retrieval)
    .bind(delta.counts.direct_injection)
    .bind(delta.counts.selected_documents)
    .bind(delta.active_owners)
    .bind(delta.active_actors)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Display fields cached on an owner counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerSnapshot<'a> {
    pub display_name: Option<&'a str>,
    pub namespace: Option<&'a str>,
}

/// Add a batch's counts to an owner's day.
///
/// `snapshot` only fills display fields that are still empty; overwriting a
/// stale snapshot is [`refresh_owner_snapshot`]'s job.
pub async fn accumulate_owner_daily<'e, E>(
    executor: E,
    date: NaiveDate,
    owner_id: i64,
    delta: &ModeCounts,
    snapshot: OwnerSnapshot<'_>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO owner_daily_counters (date, owner_id, display_name, namespace, total,
                                          rag_retrieval, direct_injection, selected_documents,
                                          created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date, owner_id) DO UPDATE SET
            display_name = COALESCE(owner_daily_counters.display_name, excluded.display_name),
            namespace = COALESCE(owner_daily_counters.namespace, excluded.namespace),
            total = owner_daily_counters.total + excluded.total,
            rag_retrieval = owner_daily_counters.rag_retrieval + excluded.rag_retrieval,
            direct_injection = owner_daily_counters.direct_injection + excluded.direct_injection,
            selected_documents = owner_daily_counters.selected_documents + excluded.selected_documents,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(date_key(date))
    .bind(owner_id)
    .bind(snapshot.display_name)
    .bind(snapshot.namespace)
    .bind(delta.total())
    .bind(delta.rag_retrieval)
    .bind(delta.direct_injection)
    .bind(delta.selected_documents)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Overwrite a day with an authoritative tally.
pub async fn replace_daily<'e, E>(executor: E, date: NaiveDate, full: &DailyTally) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO daily_counters (date, total, rag_retrieval, direct_injection, selected_documents,
                                    active_owners, active_actors, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date) DO UPDATE SET
            total = excluded.total,
            rag_retrieval = excluded.rag_retrieval,
            direct_injection = excluded.direct_injection,
            selected_documents = excluded.selected_documents,
            active_owners = excluded.active_owners,
            active_actors = excluded.active_actors,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(date_key(date))
    .bind(full.counts.total())
    .bind(full.counts.rag_retrieval)
    .bind(full.counts.direct_injection)
    .bind(full.counts.selected_documents)
    .bind(full.active_owners)
    .bind(full.active_actors)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Overwrite the cached display name and namespace of an existing owner
/// counter. Counts are untouched; returns `false` if no counter exists.
pub async fn refresh_owner_snapshot<'e, E>(
    executor: E,
    date: NaiveDate,
    owner_id: i64,
    display_name: Option<&str>,
    namespace: Option<&str>,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE owner_daily_counters SET display_name = ?, namespace = ?, updated_at = ? \
         WHERE date = ? AND owner_id = ?",
    )
    .bind(display_name)
    .bind(namespace)
    .bind(now)
    .bind(date_key(date))
    .bind(owner_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Owners that already have a counter row for `date`.
pub async fn owner_ids_for_date<'e, E>(executor: E, date: NaiveDate) -> Result<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT owner_id FROM owner_daily_counters WHERE date = ? ORDER BY owner_id",
    )
    .bind(date_key(date))
    .fetch_all(executor)
    .await?;
    Ok(ids)
}

fn mode_counts(row: &SqliteRow) -> ModeCounts {
    ModeCounts {
        rag_retrieval: row.get("rag_retrieval"),
        direct_injection: row.get("direct_injection"),
        selected_documents: row.get("selected_documents"),
    }
}

fn daily_from_row(row: &SqliteRow) -> Result<DailyCounter> {
    let date: String = row.get("date");
    Ok(DailyCounter {
        date: parse_date_key(&date)?,
        total: row.get("total"),
        counts: mode_counts(row),
        active_owners: row.get("active_owners"),
        active_actors: row.get("active_actors"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn daily<'e, E>(executor: E, date: NaiveDate) -> Result<Option<DailyCounter>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM daily_counters WHERE date = ?")
        .bind(date_key(date))
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(daily_from_row).transpose()
}

/// Daily counters in `[start, end]`, ascending by date. Days with no row are
/// absent.
pub async fn daily_range<'e, E>(
    executor: E,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<DailyCounter>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM daily_counters WHERE date >= ? AND date <= ? ORDER BY date")
        .bind(date_key(start))
        .bind(date_key(end))
        .fetch_all(executor)
        .await?;
    rows.iter().map(daily_from_row).collect()
}

pub async fn hourly_for_date<'e, E>(executor: E, date: NaiveDate) -> Result<Vec<HourlyCounter>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM hourly_counters WHERE date = ? ORDER BY hour")
        .bind(date_key(date))
        .fetch_all(executor)
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let hour: i64 = row.get("hour");
            HourlyCounter {
                date,
                hour: hour as u32,
                total: row.get("total"),
                counts: mode_counts(row),
            }
        })
        .collect())
}

/// Owner counters for a date, busiest first.
pub async fn owner_daily_for_date<'e, E>(
    executor: E,
    date: NaiveDate,
) -> Result<Vec<OwnerDailyCounter>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM owner_daily_counters WHERE date = ? ORDER BY total DESC, owner_id ASC",
    )
    .bind(date_key(date))
    .fetch_all(executor)
    .await?;

    Ok(rows
        .iter()
        .map(|row| OwnerDailyCounter {
            date,
            owner_id: row.get("owner_id"),
            display_name: row.get("display_name"),
            namespace: row.get("namespace"),
            total: row.get("total"),
            counts: mode_counts(row),
        })
        .collect())
}

/// Owner counters for one owner over `[start, end]`, ascending by date.
pub async fn owner_daily_range<'e, E>(
    executor: E,
    owner_id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<OwnerDailyCounter>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM owner_daily_counters WHERE owner_id = ? AND date >= ? AND date <= ? \
         ORDER BY date",
    )
    .bind(owner_id)
    .bind(date_key(start))
    .bind(date_key(end))
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| {
            let date: String = row.get("date");
            Ok(OwnerDailyCounter {
                date: parse_date_key(&date)?,
                owner_id,
                display_name: row.get("display_name"),
                namespace: row.get("namespace"),
                total: row.get("total"),
                counts: mode_counts(row),
            })
        })
        .collect()
}
