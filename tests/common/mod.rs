//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use usage_ledger::config::Config;
use usage_ledger::models::CategoryType;
use usage_ledger::raw_source::RawRow;
use usage_ledger::{db, migrate};

pub fn test_config(tmp: &TempDir, extra: &str) -> Config {
    let db_path = tmp.path().join("uledger.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

{}
"#,
        db_path.display(),
        extra
    );
    toml::from_str(&config_content).unwrap()
}

/// Temp dir, config, and a migrated pool.
pub async fn setup(extra: &str) -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, extra);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, cfg, pool)
}

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}

pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn kb_payload(mode: &str, owner: i64) -> Value {
    json!({
        "ragResult": {
            "injectionMode": mode,
            "query": "how do I rotate credentials?",
            "chunks": [{"text": "Rotate them in the console."}]
        },
        "knowledgeId": owner
    })
}

pub fn kb_row(id: i64, mode: &str, owner: i64, actor: i64, created: &str) -> RawRow {
    RawRow {
        id,
        actor_id: Some(actor),
        category: CategoryType::KnowledgeBase,
        payload: kb_payload(mode, owner),
        created_at: Some(at(created)),
    }
}

pub fn selected_row(id: i64, kb: i64, actor: i64, created: &str) -> RawRow {
    RawRow {
        id,
        actor_id: Some(actor),
        category: CategoryType::SelectedDocuments,
        payload: json!({"knowledgeBaseId": kb}),
        created_at: Some(at(created)),
    }
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}
