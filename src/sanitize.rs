//! Non-finite float coercion.
//!
//! SQLite REAL columns and JSON text cannot carry `NaN` or `±Infinity`, so
//! every float is passed through here before it reaches the store.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::diagnostics::Diagnostics;
use crate::reconcile::CrossValidation;
use crate::scorer::MetricMap;

pub fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

pub fn sanitize_metrics(metrics: &MetricMap) -> MetricMap {
    metrics
        .iter()
        .map(|(name, value)| (name.clone(), finite(*value)))
        .collect()
}

pub fn sanitize_scorer_metrics(
    per_scorer: &BTreeMap<String, MetricMap>,
) -> BTreeMap<String, MetricMap> {
    per_scorer
        .iter()
        .map(|(scorer, metrics)| (scorer.clone(), sanitize_metrics(metrics)))
        .collect()
}

pub fn sanitize_cross_validation(cv: &CrossValidation) -> CrossValidation {
    let mut out = cv.clone();
    out.agreement_rate = finite(out.agreement_rate);
    for pair in &mut out.pairs {
        pair.primary = finite(pair.primary);
        pair.secondary = finite(pair.secondary);
        pair.difference = finite(pair.difference);
    }
    out
}

/// Recursively replace non-finite numbers in an opaque JSON blob with null.
///
/// `serde_json::Value` cannot hold a non-finite number today, but blobs may
/// carry them as strings (`"NaN"`, `"Infinity"`) from services that
/// serialized them that way.
pub fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => value.clone(),
        },
        Value::String(s) if is_non_finite_literal(s) => Value::Null,
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn sanitize_diagnostics(diagnostics: &Diagnostics) -> Diagnostics {
    Diagnostics {
        primary: diagnostics.primary.as_ref().map(sanitize_json),
        secondary: diagnostics.secondary.as_ref().map(sanitize_json),
        overall: diagnostics.overall.as_ref().map(sanitize_json),
    }
}

fn is_non_finite_literal(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "nan" | "inf" | "+inf" | "-inf" | "infinity" | "+infinity" | "-infinity"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::PairAgreement;
    use serde_json::json;

    #[test]
    fn test_non_finite_metrics_become_null() {
        let metrics: MetricMap = [
            ("a".to_string(), Some(f64::NAN)),
            ("b".to_string(), Some(f64::INFINITY)),
            ("c".to_string(), Some(f64::NEG_INFINITY)),
            ("d".to_string(), Some(0.4)),
            ("e".to_string(), None),
        ]
        .into_iter()
        .collect();

        let clean = sanitize_metrics(&metrics);
        assert_eq!(clean["a"], None);
        assert_eq!(clean["b"], None);
        assert_eq!(clean["c"], None);
        assert_eq!(clean["d"], Some(0.4));
        assert_eq!(clean["e"], None);
    }

    #[test]
    fn test_cross_validation_floats_sanitized() {
        let cv = CrossValidation {
            pairs: vec![PairAgreement {
                name: "p".to_string(),
                primary: Some(f64::NAN),
                secondary: Some(0.5),
                difference: Some(f64::INFINITY),
                agrees: None,
                alert: false,
            }],
            compared: 0,
            agreement_rate: Some(f64::NAN),
            has_alert: false,
        };
        let clean = sanitize_cross_validation(&cv);
        assert_eq!(clean.pairs[0].primary, None);
        assert_eq!(clean.pairs[0].secondary, Some(0.5));
        assert_eq!(clean.pairs[0].difference, None);
        assert_eq!(clean.agreement_rate, None);
    }

    #[test]
    fn test_json_blob_literals_sanitized() {
        let blob = json!({"score": "NaN", "nested": [1.5, "-Infinity", "ok"]});
        assert_eq!(
            sanitize_json(&blob),
            json!({"score": null, "nested": [1.5, null, "ok"]})
        );
    }
}
