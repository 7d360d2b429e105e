//! Read-only access to the upstream database of record.
//!
//! The [`RawSource`] trait covers the read paths the sync and evaluation
//! pipelines need. Implementations:
//!
//! | Type | Use |
//! |------|-----|
//! | [`MySqlRawSource`] | Production reader over the upstream MySQL schema |
//! | [`UnconfiguredRawSource`] | No URL configured: every read is empty |
//! | [`InMemoryRawSource`] | Tests and local experiments |
//!
//! Implementations hold no sync state; cursors live in the checkpoint table.

pub mod memory;
pub mod mysql;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RawSourceConfig;
use crate::models::CategoryType;
use crate::payload::OwnerMetadata;

pub use memory::InMemoryRawSource;
pub use mysql::MySqlRawSource;

/// Snapshot of one upstream row.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub id: i64,
    /// The acting user that produced the row.
    pub actor_id: Option<i64>,
    pub category: CategoryType,
    pub payload: serde_json::Value,
    pub created_at: Option<NaiveDateTime>,
}

/// Abstract reader over the raw source.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`rows_after`](RawSource::rows_after) | Cursor page: `id > cursor`, ascending, tracked categories |
/// | [`rows_by_ids`](RawSource::rows_by_ids) | Detail hydration for explicit ids |
/// | [`extracted_text`](RawSource::extracted_text) | Large extracted source text for one row |
/// | [`owner_metadata`](RawSource::owner_metadata) | Display name / namespace / creator per owner |
/// | [`actor_names`](RawSource::actor_names) | Display names per actor |
#[async_trait]
pub trait RawSource: Send + Sync {
    /// `false` when no upstream is configured; reads then return empty results.
    fn is_configured(&self) -> bool {
        true
    }

    async fn rows_after(&self, cursor: i64, limit: usize) -> Result<Vec<RawRow>>;

    async fn rows_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, RawRow>>;

    async fn extracted_text(&self, id: i64) -> Result<Option<String>>;

    async fn owner_metadata(&self, owner_ids: &[i64]) -> Result<HashMap<i64, OwnerMetadata>>;

    async fn actor_names(&self, actor_ids: &[i64]) -> Result<HashMap<i64, String>>;
}

/// Stand-in used when `raw_source.url` is absent.
pub struct UnconfiguredRawSource;

#[async_trait]
impl RawSource for UnconfiguredRawSource {
    fn is_configured(&self) -> bool {
        false
    }

    async fn rows_after(&self, _cursor: i64, _limit: usize) -> Result<Vec<RawRow>> {
        Ok(Vec::new())
    }

    async fn rows_by_ids(&self, _ids: &[i64]) -> Result<HashMap<i64, RawRow>> {
        Ok(HashMap::new())
    }

    async fn extracted_text(&self, _id: i64) -> Result<Option<String>> {
        Ok(None)
    }

    async fn owner_metadata(&self, _owner_ids: &[i64]) -> Result<HashMap<i64, OwnerMetadata>> {
        Ok(HashMap::new())
    }

    async fn actor_names(&self, _actor_ids: &[i64]) -> Result<HashMap<i64, String>> {
        Ok(HashMap::new())
    }
}

/// Build the reader for the configured upstream.
pub async fn connect(config: &RawSourceConfig) -> Result<Arc<dyn RawSource>> {
    match config.url.as_deref() {
        Some(url) if config.is_configured() => {
            let source = MySqlRawSource::connect(url, config.max_connections).await?;
            Ok(Arc::new(source))
        }
        _ => {
            tracing::info!("raw source not configured; reads will be empty");
            Ok(Arc::new(UnconfiguredRawSource))
        }
    }
}

/// Sorted, de-duplicated copy of an id list.
pub(crate) fn unique_ids(ids: &[i64]) -> Vec<i64> {
    let mut out = ids.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}
