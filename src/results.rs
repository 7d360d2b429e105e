//! Evaluation result store and derived scores.
//!
//! One result per reference row (`UNIQUE reference_row_id`). Re-evaluation
//! overwrites the scored fields in place and keeps the result id.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};
use std::collections::{BTreeMap, HashSet};

use crate::diagnostics::Diagnostics;
use crate::models::{EvaluationResult, Judgment};
use crate::reconcile::CrossValidation;
use crate::sanitize::{finite, sanitize_cross_validation, sanitize_diagnostics, sanitize_scorer_metrics};
use crate::scorer::MetricMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TierScores {
    pub retrieval: Option<f64>,
    pub generation: Option<f64>,
    pub total: Option<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Derive tier scores from per-scorer metrics.
///
/// Metrics named in `retrieval_metrics` feed the retrieval tier, all others
/// the generation tier. Null and non-finite values are ignored. The total
/// is the mean of whichever tiers have a score.
pub fn tiered_scores(
    per_scorer: &BTreeMap<String, MetricMap>,
    retrieval_metrics: &HashSet<String>,
) -> TierScores {
    let mut retrieval = Vec::new();
    let mut generation = Vec::new();
    for metrics in per_scorer.values() {
        for (name, value) in metrics {
            let Some(v) = finite(*value) else {
                continue;
            };
            if retrieval_metrics.contains(name) {
                retrieval.push(v);
            } else {
                generation.push(v);
            }
        }
    }

    let retrieval = mean(&retrieval);
    let generation = mean(&generation);
    let tiers: Vec<f64> = [retrieval, generation].into_iter().flatten().collect();
    TierScores {
        retrieval,
        generation,
        total: mean(&tiers),
    }
}

/// `pass` at or above `threshold + margin`, `fail` below
/// `threshold - margin`, `undetermined` in between or with no score.
pub fn judge(total: Option<f64>, threshold: f64, margin: f64) -> Judgment {
    match finite(total) {
        Some(t) if t >= threshold + margin => Judgment::Pass,
        Some(t) if t < threshold - margin => Judgment::Fail,
        _ => Judgment::Undetermined,
    }
}

/// A freshly scored row, ready to persist.
#[derive(Debug, Clone)]
pub struct ScoredEvaluation {
    pub reference_row_id: i64,
    pub scorer_metrics: BTreeMap<String, MetricMap>,
    pub scorer_errors: BTreeMap<String, String>,
    pub scores: TierScores,
    pub judgment: Judgment,
    pub cross_validation: CrossValidation,
    pub diagnostics: Diagnostics,
    pub model: String,
    pub duration_ms: i64,
}

/// Insert or overwrite the result for a reference row; returns its id.
///
/// Every float is passed through [`finite`] on the way in.
pub async fn upsert<'e, E>(executor: E, scored: &ScoredEvaluation) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    let metrics = serde_json::to_string(&sanitize_scorer_metrics(&scored.scorer_metrics))?;
    let errors = serde_json::to_string(&scored.scorer_errors)?;
    let cross_validation = sanitize_cross_validation(&scored.cross_validation);
    let cv_json = serde_json::to_string(&cross_validation)?;
    let diagnostics = serde_json::to_string(&sanitize_diagnostics(&scored.diagnostics))?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO evaluation_results (reference_row_id, scorer_metrics, scorer_errors,
                                        retrieval_score, generation_score, total_score, judgment,
                                        cross_validation, has_alert, diagnostics, model, duration_ms,
                                        created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(reference_row_id) DO UPDATE SET
            scorer_metrics = excluded.scorer_metrics,
            scorer_errors = excluded.scorer_errors,
            retrieval_score = excluded.retrieval_score,
            generation_score = excluded.generation_score,
            total_score = excluded.total_score,
            judgment = excluded.judgment,
            cross_validation = excluded.cross_validation,
            has_alert = excluded.has_alert,
            diagnostics = excluded.diagnostics,
            model = excluded.model,
            duration_ms = excluded.duration_ms,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(scored.reference_row_id)
    .bind(metrics)
    .bind(errors)
    .bind(finite(scored.scores.retrieval))
    .bind(finite(scored.scores.generation))
    .bind(finite(scored.scores.total))
    .bind(scored.judgment.as_str())
    .bind(cv_json)
    .bind(cross_validation.has_alert)
    .bind(diagnostics)
    .bind(&scored.model)
    .bind(scored.duration_ms)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

fn from_row(row: &SqliteRow) -> Result<EvaluationResult> {
    let metrics: String = row.get("scorer_metrics");
    let errors: String = row.get("scorer_errors");
    let cv: String = row.get("cross_validation");
    let diagnostics: String = row.get("diagnostics");
    let judgment: String = row.get("judgment");

    Ok(EvaluationResult {
        id: row.get("id"),
        reference_row_id: row.get("reference_row_id"),
        scorer_metrics: serde_json::from_str(&metrics).context("Invalid stored scorer_metrics")?,
        scorer_errors: serde_json::from_str(&errors).context("Invalid stored scorer_errors")?,
        retrieval_score: row.get("retrieval_score"),
        generation_score: row.get("generation_score"),
        total_score: row.get("total_score"),
        judgment: judgment.parse()?,
        cross_validation: serde_json::from_str(&cv).context("Invalid stored cross_validation")?,
        has_alert: row.get("has_alert"),
        diagnostics: serde_json::from_str(&diagnostics).context("Invalid stored diagnostics")?,
        model: row.get("model"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn get<'e, E>(executor: E, id: i64) -> Result<Option<EvaluationResult>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM evaluation_results WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_for_row<'e, E>(executor: E, reference_row_id: i64) -> Result<Option<EvaluationResult>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM evaluation_results WHERE reference_row_id = ?")
        .bind(reference_row_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(from_row).transpose()
}
