use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every local table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reference_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL UNIQUE,
            owner_id INTEGER,
            actor_id INTEGER,
            category TEXT NOT NULL,
            injection_mode TEXT,
            evaluation_status TEXT NOT NULL DEFAULT 'pending',
            evaluation_result_id INTEGER,
            record_date TEXT,
            evaluated_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_counters (
            date TEXT PRIMARY KEY,
            total INTEGER NOT NULL DEFAULT 0,
            rag_retrieval INTEGER NOT NULL DEFAULT 0,
            direct_injection INTEGER NOT NULL DEFAULT 0,
            selected_documents INTEGER NOT NULL DEFAULT 0,
            active_owners INTEGER NOT NULL DEFAULT 0,
            active_actors INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hourly_counters (
            date TEXT NOT NULL,
            hour INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
            total INTEGER NOT NULL DEFAULT 0,
            rag_retrieval INTEGER NOT NULL DEFAULT 0,
            direct_injection INTEGER NOT NULL DEFAULT 0,
            selected_documents INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (date, hour)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS owner_daily_counters (
            date TEXT NOT NULL,
            owner_id INTEGER NOT NULL,
            display_name TEXT,
            namespace TEXT,
            total INTEGER NOT NULL DEFAULT 0,
            rag_retrieval INTEGER NOT NULL DEFAULT 0,
            direct_injection INTEGER NOT NULL DEFAULT 0,
            selected_documents INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (date, owner_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            channel TEXT PRIMARY KEY,
            last_cursor INTEGER NOT NULL DEFAULT 0,
            last_run_at INTEGER,
            last_status TEXT,
            last_error TEXT,
            rows_processed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evaluation_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reference_row_id INTEGER NOT NULL UNIQUE,
            scorer_metrics TEXT NOT NULL DEFAULT '{}',
            scorer_errors TEXT NOT NULL DEFAULT '{}',
            retrieval_score REAL,
            generation_score REAL,
            total_score REAL,
            judgment TEXT NOT NULL,
            cross_validation TEXT NOT NULL,
            has_alert INTEGER NOT NULL DEFAULT 0,
            diagnostics TEXT NOT NULL DEFAULT '{}',
            model TEXT NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (reference_row_id) REFERENCES reference_rows(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evaluation_jobs (
            job_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            total INTEGER NOT NULL,
            completed INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            row_ids TEXT NOT NULL,
            selection TEXT NOT NULL DEFAULT '{}',
            force INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (completed + failed + skipped <= total)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_reference_rows_record_date ON reference_rows(record_date)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reference_rows_date_owner ON reference_rows(record_date, owner_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reference_rows_status ON reference_rows(evaluation_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hourly_counters_date ON hourly_counters(date)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_owner_daily_counters_owner ON owner_daily_counters(owner_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
