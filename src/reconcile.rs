//! Cross-validation of primary against secondary scorer metrics.
//!
//! A configured pair names one primary-group metric and one secondary-group
//! metric that measure the same property. For each pair with both values
//! present, the absolute difference decides agreement
//! (`<= agreement_threshold`) and alerting (`> alert_threshold`).
//! Reconciliation never fails: missing or non-finite values only make a
//! pair incomparable.

use serde::{Deserialize, Serialize};

use crate::config::{CrossValidationConfig, MetricPairConfig};
use crate::scorer::MetricMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAgreement {
    pub name: String,
    pub primary: Option<f64>,
    pub secondary: Option<f64>,
    pub difference: Option<f64>,
    /// `None` when either side is missing.
    pub agrees: Option<bool>,
    pub alert: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub pairs: Vec<PairAgreement>,
    pub compared: usize,
    /// Share of compared pairs that agree; `None` if nothing was comparable.
    pub agreement_rate: Option<f64>,
    pub has_alert: bool,
}

pub trait Reconciler: Send + Sync {
    fn reconcile(&self, primary: &MetricMap, secondary: &MetricMap) -> CrossValidation;
}

pub struct ThresholdReconciler {
    pairs: Vec<MetricPairConfig>,
    agreement_threshold: f64,
    alert_threshold: f64,
}

impl ThresholdReconciler {
    pub fn from_config(config: &CrossValidationConfig) -> Self {
        Self {
            pairs: config.pairs.clone(),
            agreement_threshold: config.agreement_threshold,
            alert_threshold: config.alert_threshold,
        }
    }
}

fn lookup(metrics: &MetricMap, name: &str) -> Option<f64> {
    metrics.get(name).copied().flatten().filter(|v| v.is_finite())
}

impl Reconciler for ThresholdReconciler {
    fn reconcile(&self, primary: &MetricMap, secondary: &MetricMap) -> CrossValidation {
        let mut result = CrossValidation::default();
        let mut agreeing = 0usize;

        for pair in &self.pairs {
            let p = lookup(primary, &pair.primary);
            let s = lookup(secondary, &pair.secondary);
            let difference = match (p, s) {
                (Some(a), Some(b)) => Some((a - b).abs()),
                _ => None,
            };
            let agrees = difference.map(|d| d <= self.agreement_threshold);
            let alert = difference.is_some_and(|d| d > self.alert_threshold);

            if let Some(ok) = agrees {
                result.compared += 1;
                if ok {
                    agreeing += 1;
                }
            }
            result.has_alert |= alert;
            result.pairs.push(PairAgreement {
                name: pair.name.clone(),
                primary: p,
                secondary: s,
                difference,
                agrees,
                alert,
            });
        }

        if result.compared > 0 {
            result.agreement_rate = Some(agreeing as f64 / result.compared as f64);
        }
        result
    }
}
