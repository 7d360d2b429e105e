//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional. A missing `[raw_source]` URL is
//! not an error: the sync engine reports `skipped` and the evaluation path
//! sees empty raw reads.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::scorer::ScorerGroup;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub raw_source: RawSourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub scorers: Vec<ScorerConfig>,
    #[serde(default)]
    pub cross_validation: CrossValidationConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size for the local store.
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

fn default_db_max_connections() -> u32 {
    5
}

/// Connection to the read-only upstream database.
#[derive(Debug, Deserialize, Clone)]
pub struct RawSourceConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for RawSourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            page_size: default_page_size(),
            max_connections: default_max_connections(),
        }
    }
}

impl RawSourceConfig {
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

fn default_page_size() -> usize {
    1000
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_incremental_channel")]
    pub incremental_channel: String,
    #[serde(default = "default_recompute_channel")]
    pub recompute_channel: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            incremental_channel: default_incremental_channel(),
            recompute_channel: default_recompute_channel(),
        }
    }
}

fn default_incremental_channel() -> String {
    "incremental".to_string()
}
fn default_recompute_channel() -> String {
    "recompute".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvaluationConfig {
    #[serde(default = "default_scorer_timeout_secs")]
    pub scorer_timeout_secs: u64,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default)]
    pub undetermined_margin: f64,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            scorer_timeout_secs: default_scorer_timeout_secs(),
            pass_threshold: default_pass_threshold(),
            undetermined_margin: 0.0,
            model: default_model(),
        }
    }
}

fn default_scorer_timeout_secs() -> u64 {
    60
}
fn default_pass_threshold() -> f64 {
    0.6
}
fn default_model() -> String {
    "unspecified".to_string()
}

/// One remote scoring service.
///
/// `metrics` lists every metric the scorer reports; a failed call degrades
/// all of them to null. `retrieval_metrics` marks the subset that feeds the
/// retrieval tier of the derived score, the rest feed the generation tier.
#[derive(Debug, Deserialize, Clone)]
pub struct ScorerConfig {
    pub name: String,
    pub group: ScorerGroup,
    pub endpoint: String,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub retrieval_metrics: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrossValidationConfig {
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f64,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default)]
    pub pairs: Vec<MetricPairConfig>,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: default_agreement_threshold(),
            alert_threshold: default_alert_threshold(),
            pairs: Vec::new(),
        }
    }
}

fn default_agreement_threshold() -> f64 {
    0.15
}
fn default_alert_threshold() -> f64 {
    0.3
}

/// A primary-group metric and the secondary-group metric it is checked against.
#[derive(Debug, Deserialize, Clone)]
pub struct MetricPairConfig {
    pub name: String,
    pub primary: String,
    pub secondary: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_diagnostics_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_diagnostics_timeout_secs(),
        }
    }
}

fn default_diagnostics_timeout_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        bail!("db.max_connections must be > 0");
    }
    if config.raw_source.page_size == 0 {
        bail!("raw_source.page_size must be > 0");
    }

    if config.evaluation.scorer_timeout_secs == 0 {
        bail!("evaluation.scorer_timeout_secs must be > 0");
    }

    if !(0.0..=1.0).contains(&config.evaluation.pass_threshold) {
        bail!("evaluation.pass_threshold must be in [0.0, 1.0]");
    }

    if !(0.0..=0.5).contains(&config.evaluation.undetermined_margin) {
        bail!("evaluation.undetermined_margin must be in [0.0, 0.5]");
    }

    let cv = &config.cross_validation;
    for (key, value) in [
        ("agreement_threshold", cv.agreement_threshold),
        ("alert_threshold", cv.alert_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            bail!("cross_validation.{} must be in [0.0, 1.0]", key);
        }
    }
    if cv.agreement_threshold > cv.alert_threshold {
        bail!("cross_validation.agreement_threshold must be <= alert_threshold");
    }

    let mut names = HashSet::new();
    let mut primary_metrics = HashSet::new();
    let mut secondary_metrics = HashSet::new();
    for scorer in &config.scorers {
        if !names.insert(scorer.name.as_str()) {
            bail!("Duplicate scorer name: '{}'", scorer.name);
        }
        if scorer.metrics.is_empty() {
            bail!("scorers.{}.metrics must not be empty", scorer.name);
        }
        let group_metrics = match scorer.group {
            ScorerGroup::Primary => &mut primary_metrics,
            ScorerGroup::Secondary => &mut secondary_metrics,
        };
        for metric in &scorer.metrics {
            if !group_metrics.insert(metric.clone()) {
                bail!(
                    "Metric '{}' is reported by more than one {} scorer",
                    metric,
                    scorer.group.as_str()
                );
            }
        }
        if let Some(extra) = scorer
            .retrieval_metrics
            .iter()
            .find(|m| !scorer.metrics.contains(m))
        {
            bail!(
                "scorers.{}.retrieval_metrics names undeclared metric '{}'",
                scorer.name,
                extra
            );
        }
    }

    for pair in &cv.pairs {
        if !primary_metrics.contains(&pair.primary) {
            bail!(
                "cross_validation pair '{}' references unknown primary metric '{}'",
                pair.name,
                pair.primary
            );
        }
        if !secondary_metrics.contains(&pair.secondary) {
            bail!(
                "cross_validation pair '{}' references unknown secondary metric '{}'",
                pair.name,
                pair.secondary
            );
        }
    }

    Ok(())
}
