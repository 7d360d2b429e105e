//! Evaluation orchestrator.
//!
//! [`trigger`](EvaluationOrchestrator::trigger) selects candidate rows and
//! records a job; [`execute`](EvaluationOrchestrator::execute) walks the
//! job's rows one at a time:
//!
//! 1. Re-read the reference row; a row that is no longer `rag_retrieval` is
//!    skipped.
//! 2. Hydrate payload and extracted text from the raw source; empty text is
//!    skipped.
//! 3. Fan out to every scorer concurrently ([`ScorerPool::score_all`]).
//! 4. Reconcile primary against secondary metrics, then ask the
//!    diagnostician.
//! 5. Sanitize floats, derive tier scores and judgment.
//! 6. Upsert the result and link it to the row in one transaction.
//!
//! Any error in steps 1 to 6 marks that row `failed` and the job moves on.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, EvaluationConfig};
use crate::diagnostics::{create_diagnostician, DiagnosticRequest, Diagnostician};
use crate::jobs;
use crate::models::{EvaluationJob, EvaluationStatus, InjectionMode, JobStatus, Selection};
use crate::payload::ContextPayloadV1;
use crate::raw_source::RawSource;
use crate::reconcile::{Reconciler, ThresholdReconciler};
use crate::reference;
use crate::results::{self, judge, tiered_scores, ScoredEvaluation};
use crate::sanitize::sanitize_metrics;
use crate::scorer::{merged, MetricMap, ScoreInput, ScorerGroup, ScorerPool};

/// Returned by [`EvaluationOrchestrator::trigger`].
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReceipt {
    pub job_id: String,
    /// Every candidate the job will visit.
    pub total_eligible: i64,
    /// Candidates not already `completed` (differs only under `force`).
    pub pending: i64,
}

#[derive(Debug, Clone)]
struct EvaluationSettings {
    model: String,
    pass_threshold: f64,
    undetermined_margin: f64,
}

impl From<&EvaluationConfig> for EvaluationSettings {
    fn from(config: &EvaluationConfig) -> Self {
        Self {
            model: config.model.clone(),
            pass_threshold: config.pass_threshold,
            undetermined_margin: config.undetermined_margin,
        }
    }
}

pub struct EvaluationOrchestrator {
    pool: SqlitePool,
    raw: Arc<dyn RawSource>,
    scorers: ScorerPool,
    retrieval_metrics: HashSet<String>,
    reconciler: Arc<dyn Reconciler>,
    diagnostician: Arc<dyn Diagnostician>,
    settings: EvaluationSettings,
}

impl EvaluationOrchestrator {
    pub fn new(
        pool: SqlitePool,
        raw: Arc<dyn RawSource>,
        scorers: ScorerPool,
        reconciler: Arc<dyn Reconciler>,
        diagnostician: Arc<dyn Diagnostician>,
        config: &EvaluationConfig,
    ) -> Self {
        let retrieval_metrics = scorers.retrieval_metric_names();
        Self {
            pool,
            raw,
            scorers,
            retrieval_metrics,
            reconciler,
            diagnostician,
            settings: EvaluationSettings::from(config),
        }
    }

    /// HTTP scorers, threshold reconciler, and diagnostician from config.
    pub fn from_config(pool: SqlitePool, raw: Arc<dyn RawSource>, config: &Config) -> Result<Self> {
        let scorers = ScorerPool::from_config(config)?;
        let reconciler = Arc::new(ThresholdReconciler::from_config(&config.cross_validation));
        let diagnostician = create_diagnostician(&config.diagnostics)?;
        Ok(Self::new(
            pool,
            raw,
            scorers,
            reconciler,
            diagnostician,
            &config.evaluation,
        ))
    }

    /// Select candidates and record a `started` job over them.
    pub async fn trigger(&self, selection: &Selection, force: bool) -> Result<TriggerReceipt> {
        let candidates = reference::select_candidates(&self.pool, selection, force).await?;
        let row_ids: Vec<i64> = candidates.iter().map(|r| r.id).collect();
        let pending = candidates
            .iter()
            .filter(|r| r.evaluation_status != EvaluationStatus::Completed)
            .count() as i64;

        let job = jobs::create(&self.pool, &row_ids, selection, force).await?;
        info!(
            job_id = %job.job_id,
            total = job.total,
            pending,
            force,
            "evaluation job triggered"
        );

        Ok(TriggerReceipt {
            job_id: job.job_id,
            total_eligible: job.total,
            pending,
        })
    }

    /// Run a job to completion and return its final ledger entry.
    ///
    /// Row failures are counted, never raised. `Err` means the job is
    /// unknown or the ledger itself could not be written. A job that already
    /// completed is returned unchanged; any other job restarts from zero
    /// counts and walks its full row list.
    pub async fn execute(&self, job_id: &str) -> Result<EvaluationJob> {
        let job = jobs::get(&self.pool, job_id)
            .await?
            .ok_or_else(|| anyhow!("Unknown evaluation job: {}", job_id))?;
        if job.status == JobStatus::Completed {
            return Ok(job);
        }

        if job.status != JobStatus::Started {
            info!(job_id, status = %job.status, processed = job.processed(), "restarting evaluation job");
        }
        jobs::begin_run(&self.pool, job_id).await?;
        info!(job_id, total = job.total, "evaluation job running");

        for &row_id in &job.row_ids {
            let outcome = match self.evaluate_row(row_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(job_id, row_id, error = %format!("{:#}", e), "row evaluation failed");
                    if let Err(mark_err) =
                        reference::mark_status(&self.pool, row_id, EvaluationStatus::Failed).await
                    {
                        warn!(row_id, error = %mark_err, "could not mark row failed");
                    }
                    EvaluationStatus::Failed
                }
            };
            jobs::record_outcome(&self.pool, job_id, outcome).await?;
        }

        jobs::set_status(&self.pool, job_id, JobStatus::Completed).await?;
        let job = jobs::get(&self.pool, job_id)
            .await?
            .ok_or_else(|| anyhow!("Evaluation job vanished: {}", job_id))?;
        info!(
            job_id,
            completed = job.completed,
            failed = job.failed,
            skipped = job.skipped,
            "evaluation job finished"
        );
        Ok(job)
    }

    /// Run [`execute`](Self::execute) on the tokio runtime.
    pub fn spawn(self: Arc<Self>, job_id: String) -> JoinHandle<Result<EvaluationJob>> {
        tokio::spawn(async move { self.execute(&job_id).await })
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<EvaluationJob>> {
        jobs::get(&self.pool, job_id).await
    }

    /// Evaluate one row; returns `Completed` or `Skipped`.
    async fn evaluate_row(&self, row_id: i64) -> Result<EvaluationStatus> {
        let started = Instant::now();

        let Some(row) = reference::get(&self.pool, row_id).await? else {
            debug!(row_id, "reference row missing; skipping");
            return Ok(EvaluationStatus::Skipped);
        };
        if row.injection_mode != Some(InjectionMode::RagRetrieval) {
            debug!(row_id, "row no longer rag_retrieval; skipping");
            reference::mark_status(&self.pool, row_id, EvaluationStatus::Skipped).await?;
            return Ok(EvaluationStatus::Skipped);
        }

        let raw_rows = self
            .raw
            .rows_by_ids(&[row.source_id])
            .await
            .context("Failed to read raw row")?;
        let payload = raw_rows
            .get(&row.source_id)
            .map(|r| ContextPayloadV1::from_value(&r.payload))
            .unwrap_or_default();
        let text = self
            .raw
            .extracted_text(row.source_id)
            .await
            .context("Failed to read extracted text")?
            .unwrap_or_default();

        if text.is_empty() {
            debug!(row_id, "no extracted text; skipping");
            reference::mark_status(&self.pool, row_id, EvaluationStatus::Skipped).await?;
            return Ok(EvaluationStatus::Skipped);
        }

        let input = ScoreInput {
            query: payload.query().to_string(),
            answer: payload.chunk_answer().unwrap_or_else(|| text.clone()),
            context: text,
        };

        let outcomes = self.scorers.score_all(&input).await;

        let primary = sanitize_metrics(&merged(&outcomes, ScorerGroup::Primary));
        let secondary = sanitize_metrics(&merged(&outcomes, ScorerGroup::Secondary));
        let cross_validation = self.reconciler.reconcile(&primary, &secondary);

        let diagnostics = self
            .diagnostician
            .diagnose(&DiagnosticRequest {
                input: &input,
                primary: &primary,
                secondary: &secondary,
                cross_validation: &cross_validation,
            })
            .await
            .context("Diagnostics failed")?;

        let scorer_metrics: BTreeMap<String, MetricMap> = outcomes
            .iter()
            .map(|o| (o.scorer.clone(), sanitize_metrics(&o.metrics)))
            .collect();
        let scorer_errors: BTreeMap<String, String> = outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| (o.scorer.clone(), e.clone())))
            .collect();

        let scores = tiered_scores(&scorer_metrics, &self.retrieval_metrics);
        let judgment = judge(
            scores.total,
            self.settings.pass_threshold,
            self.settings.undetermined_margin,
        );

        let scored = ScoredEvaluation {
            reference_row_id: row.id,
            scorer_metrics,
            scorer_errors,
            scores,
            judgment,
            cross_validation,
            diagnostics,
            model: self.settings.model.clone(),
            duration_ms: started.elapsed().as_millis() as i64,
        };

        let mut tx = self.pool.begin().await?;
        let result_id = results::upsert(&mut *tx, &scored).await?;
        reference::link_result(&mut *tx, row.id, result_id).await?;
        tx.commit().await?;

        debug!(row_id, result_id, judgment = %judgment, "row evaluated");
        Ok(EvaluationStatus::Completed)
    }
}
