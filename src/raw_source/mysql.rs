//! MySQL reader over the upstream schema.
//!
//! Tables read: `subtask_contexts` (usage rows), `kinds` (owner metadata,
//! `kind = 'KnowledgeBase'`), and `users` (actor names). JSON columns are
//! cast to text server-side and parsed here so schema drift in the JSON
//! never fails a whole page.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{QueryBuilder, Row};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{unique_ids, RawRow, RawSource};
use crate::models::CategoryType;
use crate::payload::OwnerMetadata;

const ROW_COLUMNS: &str = "SELECT CAST(id AS SIGNED) AS id, CAST(user_id AS SIGNED) AS user_id, \
     context_type, CAST(type_data AS CHAR) AS type_data, created_at FROM subtask_contexts";

pub struct MySqlRawSource {
    pool: MySqlPool,
}

impl MySqlRawSource {
    /// Create a lazily-connecting pool; connection errors surface on first read.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .context("Invalid raw_source.url")?;
        Ok(Self { pool })
    }
}

fn parse_json_column(id: i64, column: &str, text: Option<&str>) -> serde_json::Value {
    match text {
        None => serde_json::Value::Null,
        Some(t) => serde_json::from_str(t).unwrap_or_else(|e| {
            warn!(id, column, error = %e, "unparseable JSON column");
            serde_json::Value::Null
        }),
    }
}

fn decode_row(row: &MySqlRow) -> Result<Option<RawRow>> {
    let id: i64 = row.try_get("id")?;
    let context_type: String = row.try_get("context_type")?;
    let category = match context_type.parse::<CategoryType>() {
        Ok(c) => c,
        Err(_) => {
            debug!(id, context_type, "ignoring row with untracked category");
            return Ok(None);
        }
    };
    let payload_text: Option<String> = row.try_get("type_data")?;
    let created_at: Option<NaiveDateTime> = row.try_get("created_at")?;

    Ok(Some(RawRow {
        id,
        actor_id: row.try_get("user_id")?,
        category,
        payload: parse_json_column(id, "type_data", payload_text.as_deref()),
        created_at,
    }))
}

fn push_id_list(qb: &mut QueryBuilder<'_, MySql>, ids: &[i64]) {
    qb.push(" (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl RawSource for MySqlRawSource {
    async fn rows_after(&self, cursor: i64, limit: usize) -> Result<Vec<RawRow>> {
        let rows = sqlx::query(&format!(
            "{} WHERE id > ? \
               AND context_type IN ('knowledge_base', 'selected_documents') \
               AND subtask_id > 0 \
             ORDER BY id ASC \
             LIMIT ?",
            ROW_COLUMNS
        ))
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read raw rows by cursor")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(raw) = decode_row(row)? {
                out.push(raw);
            }
        }
        Ok(out)
    }

    async fn rows_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, RawRow>> {
        let ids = unique_ids(ids);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<MySql>::new(ROW_COLUMNS);
        qb.push(" WHERE id IN");
        push_id_list(&mut qb, &ids);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to read raw rows by id")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            if let Some(raw) = decode_row(row)? {
                out.insert(raw.id, raw);
            }
        }
        Ok(out)
    }

    async fn extracted_text(&self, id: i64) -> Result<Option<String>> {
        let text: Option<Option<String>> =
            sqlx::query_scalar("SELECT extracted_text FROM subtask_contexts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read extracted text")?;
        Ok(text.flatten())
    }

    async fn owner_metadata(&self, owner_ids: &[i64]) -> Result<HashMap<i64, OwnerMetadata>> {
        let ids = unique_ids(owner_ids);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT CAST(id AS SIGNED) AS id, CAST(user_id AS SIGNED) AS user_id, name, namespace, \
             CAST(`json` AS CHAR) AS doc FROM kinds WHERE kind = 'KnowledgeBase' AND id IN",
        );
        push_id_list(&mut qb, &ids);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to read owner metadata")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let doc_text: Option<String> = row.try_get("doc")?;
            let doc = parse_json_column(id, "json", doc_text.as_deref());
            let meta = OwnerMetadata::from_parts(
                id,
                row.try_get("name")?,
                row.try_get("namespace")?,
                row.try_get("user_id")?,
                &doc,
            );
            out.insert(id, meta);
        }
        Ok(out)
    }

    async fn actor_names(&self, actor_ids: &[i64]) -> Result<HashMap<i64, String>> {
        let ids = unique_ids(actor_ids);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb =
            QueryBuilder::<MySql>::new("SELECT CAST(id AS SIGNED) AS id, user_name FROM users WHERE id IN");
        push_id_list(&mut qb, &ids);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to read actor names")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let name: Option<String> = row.try_get("user_name")?;
            if let Some(name) = name {
                out.insert(id, name);
            }
        }
        Ok(out)
    }
}
