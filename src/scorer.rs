//! Scorer contract and concurrent fan-out.
//!
//! A [`Scorer`] returns `Result<MetricMap, ScorerError>`; the [`ScorerPool`]
//! runs every scorer concurrently on the same input, bounds each call with
//! a timeout, and collects one [`ScorerOutcome`] per scorer. A failing or
//! slow scorer degrades to all-null metrics and never cancels its siblings.
//!
//! # HTTP adapter
//!
//! [`HttpScorer`] posts `{query, context, answer, metrics}` as JSON to the
//! configured endpoint and accepts either `{"metrics": {..}}` or a flat
//! object of metric values. Values may be numbers, `null`, or numeric
//! strings (`"NaN"` and `"inf"` included; they are sanitized before
//! storage).

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, ScorerConfig};

/// Metric name → value. `None` marks a missing or failed value.
pub type MetricMap = BTreeMap<String, Option<f64>>;

/// The triple every scorer sees for one row.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreInput {
    pub query: String,
    pub context: String,
    pub answer: String,
}

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Scorers are split into two groups whose overlapping metrics are
/// cross-validated against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerGroup {
    Primary,
    Secondary,
}

impl ScorerGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScorerGroup::Primary => "primary",
            ScorerGroup::Secondary => "secondary",
        }
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    fn group(&self) -> ScorerGroup;

    /// Every metric this scorer reports.
    fn metric_names(&self) -> &[String];

    /// The subset of [`metric_names`](Scorer::metric_names) that measures
    /// retrieval rather than generation.
    fn retrieval_metrics(&self) -> &[String] {
        &[]
    }

    async fn score(&self, input: &ScoreInput) -> Result<MetricMap, ScorerError>;
}

/// What one scorer produced for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorerOutcome {
    pub scorer: String,
    pub group: ScorerGroup,
    pub metrics: MetricMap,
    pub error: Option<String>,
}

impl ScorerOutcome {
    fn degraded(scorer: &dyn Scorer, error: &ScorerError) -> Self {
        Self {
            scorer: scorer.name().to_string(),
            group: scorer.group(),
            metrics: scorer
                .metric_names()
                .iter()
                .map(|m| (m.clone(), None))
                .collect(),
            error: Some(error.to_string()),
        }
    }

    /// Declared metrics are always present; values the scorer did not
    /// return are `None`.
    fn succeeded(scorer: &dyn Scorer, mut returned: MetricMap) -> Self {
        for name in scorer.metric_names() {
            returned.entry(name.clone()).or_insert(None);
        }
        Self {
            scorer: scorer.name().to_string(),
            group: scorer.group(),
            metrics: returned,
            error: None,
        }
    }
}

pub struct ScorerPool {
    scorers: Vec<Arc<dyn Scorer>>,
    timeout: Duration,
}

impl ScorerPool {
    pub fn new(scorers: Vec<Arc<dyn Scorer>>, timeout: Duration) -> Self {
        Self { scorers, timeout }
    }

    /// One [`HttpScorer`] per `[[scorers]]` entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.evaluation.scorer_timeout_secs);
        let mut scorers: Vec<Arc<dyn Scorer>> = Vec::with_capacity(config.scorers.len());
        for sc in &config.scorers {
            scorers.push(Arc::new(HttpScorer::new(sc, timeout)?));
        }
        Ok(Self::new(scorers, timeout))
    }

    pub fn len(&self) -> usize {
        self.scorers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }

    /// Metric names that feed the retrieval tier, across all scorers.
    pub fn retrieval_metric_names(&self) -> HashSet<String> {
        self.scorers
            .iter()
            .flat_map(|s| s.retrieval_metrics().iter().cloned())
            .collect()
    }

    /// Run every scorer concurrently and wait for all of them.
    ///
    /// Outcomes are returned in pool order. No error escapes: failures and
    /// timeouts become degraded outcomes.
    pub async fn score_all(&self, input: &ScoreInput) -> Vec<ScorerOutcome> {
        let calls = self.scorers.iter().map(|scorer| async move {
            let scorer = scorer.as_ref();
            let result = match tokio::time::timeout(self.timeout, scorer.score(input)).await {
                Ok(result) => result,
                Err(_) => Err(ScorerError::Timeout {
                    secs: self.timeout.as_secs(),
                }),
            };
            match result {
                Ok(metrics) => {
                    debug!(scorer = scorer.name(), metrics = metrics.len(), "scorer finished");
                    ScorerOutcome::succeeded(scorer, metrics)
                }
                Err(e) => {
                    warn!(scorer = scorer.name(), error = %e, "scorer failed; metrics degraded to null");
                    ScorerOutcome::degraded(scorer, &e)
                }
            }
        });
        join_all(calls).await
    }
}

/// Union of every outcome's metrics in `group`.
pub fn merged(outcomes: &[ScorerOutcome], group: ScorerGroup) -> MetricMap {
    outcomes
        .iter()
        .filter(|o| o.group == group)
        .flat_map(|o| o.metrics.iter().map(|(k, v)| (k.clone(), *v)))
        .collect()
}

// ============ HTTP Scorer ============

pub struct HttpScorer {
    name: String,
    group: ScorerGroup,
    endpoint: String,
    metrics: Vec<String>,
    retrieval_metrics: Vec<String>,
    client: reqwest::Client,
}

impl HttpScorer {
    pub fn new(config: &ScorerConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("Failed to build HTTP client for scorer '{}'", config.name))?;
        Ok(Self {
            name: config.name.clone(),
            group: config.group,
            endpoint: config.endpoint.clone(),
            metrics: config.metrics.clone(),
            retrieval_metrics: config.retrieval_metrics.clone(),
            client,
        })
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> ScorerGroup {
        self.group
    }

    fn metric_names(&self) -> &[String] {
        &self.metrics
    }

    fn retrieval_metrics(&self) -> &[String] {
        &self.retrieval_metrics
    }

    async fn score(&self, input: &ScoreInput) -> Result<MetricMap, ScorerError> {
        let body = serde_json::json!({
            "query": input.query,
            "context": input.context,
            "answer": input.answer,
            "metrics": self.metrics,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ScorerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScorerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ScorerError::Malformed(e.to_string()))?;
        parse_metric_response(&json)
    }
}

/// Read metric values from `{"metrics": {..}}` or a flat object.
pub fn parse_metric_response(json: &Value) -> Result<MetricMap, ScorerError> {
    let object = json
        .get("metrics")
        .unwrap_or(json)
        .as_object()
        .ok_or_else(|| ScorerError::Malformed("expected a JSON object of metrics".to_string()))?;

    Ok(object
        .iter()
        .map(|(name, value)| {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            (name.clone(), parsed)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed {
        name: String,
        metrics: Vec<String>,
        result: Option<f64>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Scorer for Fixed {
        fn name(&self) -> &str {
            &self.name
        }
        fn group(&self) -> ScorerGroup {
            ScorerGroup::Primary
        }
        fn metric_names(&self) -> &[String] {
            &self.metrics
        }
        async fn score(&self, _input: &ScoreInput) -> Result<MetricMap, ScorerError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.result {
                Some(v) => Ok(self.metrics.iter().map(|m| (m.clone(), Some(v))).collect()),
                None => Err(ScorerError::Transport("connection refused".to_string())),
            }
        }
    }

    fn fixed(name: &str, metric: &str, result: Option<f64>, delay: Option<Duration>) -> Arc<dyn Scorer> {
        Arc::new(Fixed {
            name: name.to_string(),
            metrics: vec![metric.to_string()],
            result,
            delay,
        })
    }

    fn input() -> ScoreInput {
        ScoreInput {
            query: "q".to_string(),
            context: "c".to_string(),
            answer: "a".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_scorer_degrades_without_affecting_siblings() {
        let pool = ScorerPool::new(
            vec![
                fixed("ok", "faithfulness", Some(0.8), None),
                fixed("broken", "relevance", None, None),
            ],
            Duration::from_secs(5),
        );

        let outcomes = pool.score_all(&input()).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].metrics["faithfulness"], Some(0.8));
        assert!(outcomes[0].error.is_none());
        assert_eq!(outcomes[1].metrics["relevance"], None);
        assert!(outcomes[1].error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_slow_scorer_times_out() {
        let pool = ScorerPool::new(
            vec![
                fixed("slow", "faithfulness", Some(0.8), Some(Duration::from_secs(30))),
                fixed("fast", "relevance", Some(0.5), None),
            ],
            Duration::from_millis(50),
        );

        let outcomes = pool.score_all(&input()).await;
        assert_eq!(outcomes[0].metrics["faithfulness"], None);
        assert!(outcomes[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(outcomes[1].metrics["relevance"], Some(0.5));
    }

    #[test]
    fn test_parse_metric_response_shapes() {
        let nested = parse_metric_response(&json!({"metrics": {"a": 0.5, "b": null}})).unwrap();
        assert_eq!(nested["a"], Some(0.5));
        assert_eq!(nested["b"], None);

        let flat = parse_metric_response(&json!({"a": "NaN", "b": "0.25"})).unwrap();
        assert!(flat["a"].unwrap().is_nan());
        assert_eq!(flat["b"], Some(0.25));

        assert!(parse_metric_response(&json!([1, 2])).is_err());
    }
}
