//! Narrative diagnostics for an evaluated row.
//!
//! The diagnostician is an external collaborator; its output is stored as
//! opaque JSON. [`create_diagnostician`] picks the implementation from
//! config:
//!
//! - **[`DisabledDiagnostician`]** when `diagnostics.endpoint` is absent.
//! - **[`HttpDiagnostician`]** otherwise.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DiagnosticsConfig;
use crate::reconcile::CrossValidation;
use crate::scorer::{MetricMap, ScoreInput};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub primary: Option<Value>,
    pub secondary: Option<Value>,
    pub overall: Option<Value>,
}

/// Everything a diagnostician may look at.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticRequest<'a> {
    pub input: &'a ScoreInput,
    pub primary: &'a MetricMap,
    pub secondary: &'a MetricMap,
    pub cross_validation: &'a CrossValidation,
}

#[async_trait]
pub trait Diagnostician: Send + Sync {
    async fn diagnose(&self, request: &DiagnosticRequest<'_>) -> Result<Diagnostics>;
}

pub struct DisabledDiagnostician;

#[async_trait]
impl Diagnostician for DisabledDiagnostician {
    async fn diagnose(&self, _request: &DiagnosticRequest<'_>) -> Result<Diagnostics> {
        Ok(Diagnostics::default())
    }
}

pub struct HttpDiagnostician {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpDiagnostician {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Diagnostician for HttpDiagnostician {
    async fn diagnose(&self, request: &DiagnosticRequest<'_>) -> Result<Diagnostics> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context("Diagnostics request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Diagnostics service error {}: {}", status, body);
        }

        let diagnostics: Diagnostics = response
            .json()
            .await
            .context("Invalid diagnostics response")?;
        Ok(diagnostics)
    }
}

pub fn create_diagnostician(config: &DiagnosticsConfig) -> Result<Arc<dyn Diagnostician>> {
    match config.endpoint.as_deref().map(str::trim) {
        Some(endpoint) if !endpoint.is_empty() => {
            Ok(Arc::new(HttpDiagnostician::new(endpoint, config.timeout_secs)?))
        }
        _ => Ok(Arc::new(DisabledDiagnostician)),
    }
}
