//! Typed views over the raw source's JSON payloads.
//!
//! Raw rows embed a free-form JSON document whose keys have appeared in both
//! `snake_case` and `camelCase` over time. [`ContextPayloadV1`] accepts either
//! spelling and tolerates missing fields. Each field is read on its own: a
//! sibling with an unexpected type becomes `None` (or empty) instead of
//! discarding the whole payload. Owner metadata descriptions come in several
//! shapes and are normalized through [`Description`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Schema v1 of a raw row's context payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextPayloadV1 {
    #[serde(default, alias = "ragResult", deserialize_with = "lenient_object")]
    pub rag_result: Option<RagResult>,
    #[serde(default, alias = "knowledgeId", deserialize_with = "lenient_id")]
    pub knowledge_id: Option<i64>,
    #[serde(default, alias = "knowledgeBaseId", deserialize_with = "lenient_id")]
    pub knowledge_base_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RagResult {
    #[serde(default, alias = "injectionMode", deserialize_with = "lenient_string")]
    pub injection_mode: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "lenient_chunks")]
    pub chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievedChunk {
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: Option<String>,
}

// ============ Lenient field readers ============

/// Integer ids, also accepted as numeric strings.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// A nested object; anything else (or an object that still fails) is `None`.
fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    Ok(match Value::deserialize(deserializer)? {
        v @ Value::Object(_) => serde_json::from_value(v).ok(),
        _ => None,
    })
}

/// Chunk list; `null` or a non-array is empty and malformed entries are dropped.
fn lenient_chunks<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<RetrievedChunk>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

impl ContextPayloadV1 {
    /// Parse a payload, falling back to an empty payload when the document
    /// does not match the schema.
    pub fn from_value(value: &Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        match serde_json::from_value(value.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "payload does not match schema v1");
                Self::default()
            }
        }
    }

    pub fn query(&self) -> &str {
        self.rag_result
            .as_ref()
            .and_then(|r| r.query.as_deref())
            .unwrap_or("")
    }

    /// The generated answer reconstructed from retrieved chunk texts, if any.
    pub fn chunk_answer(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .rag_result
            .as_ref()?
            .chunks
            .iter()
            .filter_map(|c| c.text.as_deref())
            .filter(|t| !t.is_empty())
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}

/// An owner description as stored upstream: plain text, a summary object,
/// a list of fragments, or anything else.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Text(String),
    List(Vec<Value>),
    Summary(Map<String, Value>),
    Other(Value),
}

impl Description {
    /// Collapse to a single display string.
    pub fn normalize(&self) -> Option<String> {
        match self {
            Description::Text(s) => Some(s.clone()),
            Description::List(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                Some(parts.join("; "))
            }
            Description::Summary(map) => ["short_summary", "long_summary", "summary"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str).map(str::to_string))
                .or_else(|| serde_json::to_string(map).ok()),
            Description::Other(Value::Null) => None,
            Description::Other(v) => Some(v.to_string()),
        }
    }
}

/// Display metadata for an owning entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OwnerMetadata {
    pub owner_id: i64,
    pub display_name: Option<String>,
    pub namespace: Option<String>,
    pub creator_actor_id: Option<i64>,
    pub description: Option<String>,
    pub kind: Option<String>,
}

impl OwnerMetadata {
    /// Build from the metadata table's flat columns and its JSON document.
    /// Nested `spec.name` and `metadata.namespace` win over the flat columns.
    pub fn from_parts(
        owner_id: i64,
        name_column: Option<String>,
        namespace_column: Option<String>,
        creator_actor_id: Option<i64>,
        document: &Value,
    ) -> Self {
        let spec = document.get("spec");
        let metadata = document.get("metadata");

        let display_name = spec
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(name_column);
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(namespace_column);

        let raw_description = spec
            .and_then(|s| {
                ["description", "desc", "summary"]
                    .iter()
                    .find_map(|k| s.get(*k).filter(|v| !v.is_null()))
            })
            .or_else(|| {
                metadata
                    .and_then(|m| m.get("annotations"))
                    .and_then(|a| a.get("description"))
                    .filter(|v| !v.is_null())
            });
        let description = raw_description
            .and_then(|v| serde_json::from_value::<Description>(v.clone()).ok())
            .and_then(|d| d.normalize());

        let kind = spec
            .and_then(|s| s.get("kbType"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            owner_id,
            display_name,
            namespace,
            creator_actor_id,
            description,
            kind,
        }
    }
}
