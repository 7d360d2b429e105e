//! Read-side summaries over the local store.
//!
//! Each report has a query function returning a plain struct and a
//! `print_*` function used by the `uledger report` commands.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::aggregate;
use crate::models::{
    date_key, DailyCounter, EvaluationStatus, HourlyCounter, InjectionMode, ModeCounts,
    OwnerDailyCounter,
};
use crate::payload::OwnerMetadata;
use crate::raw_source::RawSource;

/// Evaluation progress of one day's `rag_retrieval` rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationCoverage {
    pub eligible: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub pending: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyOverview {
    pub date: NaiveDate,
    pub counter: Option<DailyCounter>,
    pub coverage: EvaluationCoverage,
}

pub async fn daily_overview(pool: &SqlitePool, date: NaiveDate) -> Result<DailyOverview> {
    let counter = aggregate::daily(pool, date).await?;

    let rows = sqlx::query(
        "SELECT evaluation_status, COUNT(*) AS n FROM reference_rows \
         WHERE record_date = ? AND injection_mode = ? GROUP BY evaluation_status",
    )
    .bind(date_key(date))
    .bind(InjectionMode::RagRetrieval.as_str())
    .fetch_all(pool)
    .await?;

    let mut coverage = EvaluationCoverage::default();
    for row in &rows {
        let status: String = row.get("evaluation_status");
        let n: i64 = row.get("n");
        coverage.eligible += n;
        match status.parse::<EvaluationStatus>()? {
            EvaluationStatus::Completed => coverage.completed += n,
            EvaluationStatus::Failed => coverage.failed += n,
            EvaluationStatus::Skipped => coverage.skipped += n,
            EvaluationStatus::Pending => coverage.pending += n,
        }
    }

    Ok(DailyOverview {
        date,
        counter,
        coverage,
    })
}

/// All 24 hours of a date; hours without a counter row are zero.
pub async fn hourly_breakdown(pool: &SqlitePool, date: NaiveDate) -> Result<Vec<HourlyCounter>> {
    let stored: HashMap<u32, HourlyCounter> = aggregate::hourly_for_date(pool, date)
        .await?
        .into_iter()
        .map(|h| (h.hour, h))
        .collect();

    Ok((0..24)
        .map(|hour| {
            stored.get(&hour).cloned().unwrap_or(HourlyCounter {
                date,
                hour,
                total: 0,
                counts: ModeCounts::default(),
            })
        })
        .collect())
}

pub async fn top_owners(
    pool: &SqlitePool,
    date: NaiveDate,
    limit: usize,
) -> Result<Vec<OwnerDailyCounter>> {
    let mut owners = aggregate::owner_daily_for_date(pool, date).await?;
    owners.truncate(limit);
    Ok(owners)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub total: i64,
    pub counts: ModeCounts,
    pub active_owners: i64,
    pub active_actors: i64,
}

/// One point per day for the `days` days ending at `end`, oldest first.
/// Days without a counter are zero.
pub async fn trends(pool: &SqlitePool, end: NaiveDate, days: u32) -> Result<Vec<TrendPoint>> {
    let days = days.max(1);
    let start = end - Duration::days(i64::from(days) - 1);
    let stored: HashMap<NaiveDate, DailyCounter> = aggregate::daily_range(pool, start, end)
        .await?
        .into_iter()
        .map(|d| (d.date, d))
        .collect();

    Ok((0..days)
        .map(|offset| {
            let date = start + Duration::days(i64::from(offset));
            match stored.get(&date) {
                Some(d) => TrendPoint {
                    date,
                    total: d.total,
                    counts: d.counts,
                    active_owners: d.active_owners,
                    active_actors: d.active_actors,
                },
                None => TrendPoint {
                    date,
                    total: 0,
                    counts: ModeCounts::default(),
                    active_owners: 0,
                    active_actors: 0,
                },
            }
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub evaluated: i64,
    pub pass: i64,
    pub fail: i64,
    pub undetermined: i64,
    /// `pass / (pass + fail)`; undetermined rows are left out.
    pub pass_rate: Option<f64>,
    pub avg_total_score: Option<f64>,
    pub avg_retrieval_score: Option<f64>,
    pub avg_generation_score: Option<f64>,
    pub alerts: i64,
}

/// Results for rows whose record date falls in `[start, end]`.
pub async fn evaluation_summary(
    pool: &SqlitePool,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<EvaluationSummary> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(e.id) AS evaluated,
            COALESCE(SUM(CASE WHEN e.judgment = 'pass' THEN 1 ELSE 0 END), 0) AS pass,
            COALESCE(SUM(CASE WHEN e.judgment = 'fail' THEN 1 ELSE 0 END), 0) AS fail,
            COALESCE(SUM(CASE WHEN e.judgment = 'undetermined' THEN 1 ELSE 0 END), 0) AS undetermined,
            AVG(e.total_score) AS avg_total,
            AVG(e.retrieval_score) AS avg_retrieval,
            AVG(e.generation_score) AS avg_generation,
            COALESCE(SUM(e.has_alert), 0) AS alerts
        FROM evaluation_results e
        JOIN reference_rows r ON r.id = e.reference_row_id
        WHERE r.record_date >= ? AND r.record_date <= ?
        "#,
    )
    .bind(date_key(start))
    .bind(date_key(end))
    .fetch_one(pool)
    .await?;

    let pass: i64 = row.get("pass");
    let fail: i64 = row.get("fail");
    let decided = pass + fail;

    Ok(EvaluationSummary {
        evaluated: row.get("evaluated"),
        pass,
        fail,
        undetermined: row.get("undetermined"),
        pass_rate: (decided > 0).then(|| pass as f64 / decided as f64),
        avg_total_score: row.get("avg_total"),
        avg_retrieval_score: row.get("avg_retrieval"),
        avg_generation_score: row.get("avg_generation"),
        alerts: row.get("alerts"),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnerDetail {
    pub owner_id: i64,
    pub metadata: Option<OwnerMetadata>,
    pub creator_name: Option<String>,
    /// The owner's counters for the last 30 days ending at `as_of`.
    pub recent: Vec<OwnerDailyCounter>,
}

pub async fn owner_detail(
    pool: &SqlitePool,
    raw: &dyn RawSource,
    owner_id: i64,
    as_of: NaiveDate,
) -> Result<OwnerDetail> {
    let metadata = raw.owner_metadata(&[owner_id]).await?.remove(&owner_id);

    let creator_name = match metadata.as_ref().and_then(|m| m.creator_actor_id) {
        Some(actor_id) => raw.actor_names(&[actor_id]).await?.remove(&actor_id),
        None => None,
    };

    let recent =
        aggregate::owner_daily_range(pool, owner_id, as_of - Duration::days(29), as_of).await?;

    Ok(OwnerDetail {
        owner_id,
        metadata,
        creator_name,
        recent,
    })
}

// ============ Printing ============

fn fmt_score(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "-".to_string())
}

pub fn print_daily(overview: &DailyOverview) {
    println!("daily {}", overview.date);
    match &overview.counter {
        Some(c) => {
            println!("  total:              {}", c.total);
            println!("  rag_retrieval:      {}", c.counts.rag_retrieval);
            println!("  direct_injection:   {}", c.counts.direct_injection);
            println!("  selected_documents: {}", c.counts.selected_documents);
            println!("  active owners:      {}", c.active_owners);
            println!("  active actors:      {}", c.active_actors);
        }
        None => println!("  no counters for this date"),
    }
    let cov = &overview.coverage;
    println!(
        "  evaluation: {} eligible, {} completed, {} failed, {} skipped, {} pending",
        cov.eligible, cov.completed, cov.failed, cov.skipped, cov.pending
    );
}

pub fn print_hourly(hours: &[HourlyCounter]) {
    println!("  {:>4} {:>8} {:>8} {:>8} {:>8}", "HOUR", "TOTAL", "RAG", "DIRECT", "SELECTED");
    println!("  {}", "-".repeat(42));
    for h in hours {
        println!(
            "  {:>4} {:>8} {:>8} {:>8} {:>8}",
            h.hour, h.total, h.counts.rag_retrieval, h.counts.direct_injection, h.counts.selected_documents
        );
    }
}

pub fn print_owners(owners: &[OwnerDailyCounter]) {
    if owners.is_empty() {
        println!("No owner activity.");
        return;
    }
    println!(
        "  {:>8} {:<28} {:<16} {:>7} {:>6} {:>6} {:>8}",
        "OWNER", "NAME", "NAMESPACE", "TOTAL", "RAG", "DIRECT", "SELECTED"
    );
    println!("  {}", "-".repeat(86));
    for o in owners {
        println!(
            "  {:>8} {:<28} {:<16} {:>7} {:>6} {:>6} {:>8}",
            o.owner_id,
            o.display_name.as_deref().unwrap_or("-"),
            o.namespace.as_deref().unwrap_or("-"),
            o.total,
            o.counts.rag_retrieval,
            o.counts.direct_injection,
            o.counts.selected_documents
        );
    }
}

pub fn print_trends(points: &[TrendPoint]) {
    println!(
        "  {:<10} {:>8} {:>8} {:>8} {:>8} {:>7} {:>7}",
        "DATE", "TOTAL", "RAG", "DIRECT", "SELECTED", "OWNERS", "ACTORS"
    );
    println!("  {}", "-".repeat(64));
    for p in points {
        println!(
            "  {:<10} {:>8} {:>8} {:>8} {:>8} {:>7} {:>7}",
            p.date,
            p.total,
            p.counts.rag_retrieval,
            p.counts.direct_injection,
            p.counts.selected_documents,
            p.active_owners,
            p.active_actors
        );
    }
}

pub fn print_evaluation_summary(start: NaiveDate, end: NaiveDate, s: &EvaluationSummary) {
    println!("evaluations {} .. {}", start, end);
    println!("  evaluated:      {}", s.evaluated);
    println!("  pass:           {}", s.pass);
    println!("  fail:           {}", s.fail);
    println!("  undetermined:   {}", s.undetermined);
    println!(
        "  pass rate:      {}",
        s.pass_rate
            .map(|r| format!("{:.1}%", r * 100.0))
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  avg total:      {}", fmt_score(s.avg_total_score));
    println!("  avg retrieval:  {}", fmt_score(s.avg_retrieval_score));
    println!("  avg generation: {}", fmt_score(s.avg_generation_score));
    println!("  alerts:         {}", s.alerts);
}

pub fn print_owner_detail(detail: &OwnerDetail) {
    println!("owner {}", detail.owner_id);
    match &detail.metadata {
        Some(m) => {
            println!("  name:        {}", m.display_name.as_deref().unwrap_or("-"));
            println!("  namespace:   {}", m.namespace.as_deref().unwrap_or("-"));
            println!("  kind:        {}", m.kind.as_deref().unwrap_or("-"));
            println!(
                "  creator:     {}",
                detail.creator_name.as_deref().unwrap_or("-")
            );
            if let Some(desc) = &m.description {
                println!("  description: {}", desc);
            }
        }
        None => println!("  no metadata in raw source"),
    }
    let total: i64 = detail.recent.iter().map(|o| o.total).sum();
    println!("  last 30 days: {} uses over {} active days", total, detail.recent.len());
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
