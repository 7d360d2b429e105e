//! Sync engine: raw source → reference rows → aggregate counters.
//!
//! # Incremental channel
//!
//! 1. Read the channel cursor (0 if the channel never ran).
//! 2. Fetch up to `page_size` raw rows with `id > cursor`, ascending.
//! 3. In one transaction: insert each row into `reference_rows` unless its
//!    `source_id` is already known, fold only the newly inserted rows into
//!    hourly, daily, and owner-daily counters, and advance the cursor to
//!    the largest id in the batch.
//! 4. On any error the transaction rolls back and a failed checkpoint is
//!    written with the cursor untouched, so the batch is safe to retry.
//!
//! Re-delivered rows (already known `source_id`) are counted as skipped and
//! never re-aggregated.
//!
//! # Recompute channel
//!
//! Re-derives one day's [`DailyCounter`](crate::models::DailyCounter) from
//! `reference_rows` and overwrites it, then refreshes the cached owner
//! display fields from the raw source. The two steps commit separately: a
//! failed owner refresh reports `failed` but keeps the rebuilt counter.
//! Hourly counters are left as they are.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregate::{self, DailyTally, OwnerSnapshot};
use crate::checkpoint;
use crate::classify::{classify, Classification};
use crate::config::Config;
use crate::models::{ModeCounts, ReferenceRow, SyncCheckpoint};
use crate::payload::{ContextPayloadV1, OwnerMetadata};
use crate::raw_source::{RawRow, RawSource};
use crate::reference::{self, NewReferenceRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Failed,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub rows_synced: i64,
    pub rows_skipped: i64,
    pub new_cursor: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecomputeReport {
    pub status: SyncStatus,
    pub date: NaiveDate,
    pub rows_scanned: i64,
    pub total: i64,
    pub counts: ModeCounts,
    pub active_owners: i64,
    pub active_actors: i64,
    pub owners_refreshed: i64,
    pub error: Option<String>,
}

impl RecomputeReport {
    fn empty(status: SyncStatus, date: NaiveDate) -> Self {
        Self {
            status,
            date,
            rows_scanned: 0,
            total: 0,
            counts: ModeCounts::default(),
            active_owners: 0,
            active_actors: 0,
            owners_refreshed: 0,
            error: None,
        }
    }
}

/// Checkpoints of both channels.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOverview {
    pub raw_source_configured: bool,
    pub incremental: Option<SyncCheckpoint>,
    pub recompute: Option<SyncCheckpoint>,
}

#[derive(Debug, Clone)]
struct SyncSettings {
    incremental_channel: String,
    recompute_channel: String,
    page_size: usize,
}

pub struct SyncEngine {
    pool: SqlitePool,
    raw: Arc<dyn RawSource>,
    settings: SyncSettings,
}

struct BatchOutcome {
    inserted: i64,
    skipped: i64,
    cursor: i64,
}

impl SyncEngine {
    pub fn new(pool: SqlitePool, raw: Arc<dyn RawSource>, config: &Config) -> Self {
        Self {
            pool,
            raw,
            settings: SyncSettings {
                incremental_channel: config.sync.incremental_channel.clone(),
                recompute_channel: config.sync.recompute_channel.clone(),
                page_size: config.raw_source.page_size,
            },
        }
    }

    /// Process one page of new raw rows.
    ///
    /// Returns `Err` only when the failed checkpoint itself cannot be
    /// written; batch failures are reported through `status`.
    pub async fn run_incremental(&self) -> Result<SyncReport> {
        let channel = self.settings.incremental_channel.as_str();
        let cursor = checkpoint::cursor(&self.pool, channel).await?;

        if !self.raw.is_configured() {
            info!(channel, "raw source not configured; sync skipped");
            return Ok(SyncReport {
                status: SyncStatus::Skipped,
                rows_synced: 0,
                rows_skipped: 0,
                new_cursor: cursor,
                error: None,
            });
        }

        info!(channel, cursor, "incremental sync started");
        match self.incremental_batch(channel, cursor).await {
            Ok(outcome) => {
                info!(
                    channel,
                    inserted = outcome.inserted,
                    skipped = outcome.skipped,
                    cursor = outcome.cursor,
                    "incremental sync finished"
                );
                Ok(SyncReport {
                    status: SyncStatus::Success,
                    rows_synced: outcome.inserted,
                    rows_skipped: outcome.skipped,
                    new_cursor: outcome.cursor,
                    error: None,
                })
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(channel, cursor, error = %message, "incremental sync failed");
                checkpoint::record_failure(&self.pool, channel, &message)
                    .await
                    .context("Failed to record failed checkpoint")?;
                Ok(SyncReport {
                    status: SyncStatus::Failed,
                    rows_synced: 0,
                    rows_skipped: 0,
                    new_cursor: cursor,
                    error: Some(message),
                })
            }
        }
    }

    async fn incremental_batch(&self, channel: &str, cursor: i64) -> Result<BatchOutcome> {
        let mut rows = self
            .raw
            .rows_after(cursor, self.settings.page_size)
            .await
            .context("Failed to fetch raw rows")?;
        rows.sort_by_key(|r| r.id);

        if rows.is_empty() {
            checkpoint::record_success(&self.pool, channel, cursor, 0).await?;
            return Ok(BatchOutcome {
                inserted: 0,
                skipped: 0,
                cursor,
            });
        }

        let classified: Vec<(&RawRow, Classification)> = rows
            .iter()
            .map(|row| {
                let payload = ContextPayloadV1::from_value(&row.payload);
                (row, classify(row.category, &payload))
            })
            .collect();

        let owners = self.owner_snapshots(&classified).await;

        let mut tx = self.pool.begin().await?;
        let mut fresh = Vec::with_capacity(classified.len());
        let mut skipped = 0i64;
        let mut max_id = cursor;

        for (row, class) in &classified {
            let new_row = NewReferenceRow {
                source_id: row.id,
                owner_id: class.owner_id,
                actor_id: row.actor_id,
                category: row.category,
                injection_mode: class.stored_mode(),
                record_date: row.created_at.map(|t| t.date()),
            };
            if reference::insert_if_absent(&mut *tx, &new_row).await? {
                fresh.push((*row, *class));
            } else {
                debug!(source_id = row.id, "row already known; skipping");
                skipped += 1;
            }
            max_id = max_id.max(row.id);
        }

        let fold = fold_batch(&fresh);
        for ((date, hour), counts) in &fold.hourly {
            aggregate::accumulate_hourly(&mut *tx, *date, *hour, counts).await?;
        }
        for (date, tally) in &fold.daily {
            aggregate::accumulate_daily(&mut *tx, *date, tally).await?;
        }
        for ((date, owner_id), counts) in &fold.owners {
            let snapshot = owners
                .get(owner_id)
                .map(|m| OwnerSnapshot {
                    display_name: m.display_name.as_deref(),
                    namespace: m.namespace.as_deref(),
                })
                .unwrap_or_default();
            aggregate::accumulate_owner_daily(&mut *tx, *date, *owner_id, counts, snapshot)
                .await?;
        }

        let inserted = fresh.len() as i64;
        checkpoint::record_success(&mut *tx, channel, max_id, inserted).await?;
        tx.commit().await?;

        Ok(BatchOutcome {
            inserted,
            skipped,
            cursor: max_id,
        })
    }

    /// Owner display fields for a batch. A metadata read failure only costs
    /// the snapshot, never the batch.
    async fn owner_snapshots(
        &self,
        classified: &[(&RawRow, Classification)],
    ) -> HashMap<i64, OwnerMetadata> {
        let ids: Vec<i64> = classified.iter().filter_map(|(_, c)| c.owner_id).collect();
        if ids.is_empty() {
            return HashMap::new();
        }
        match self.raw.owner_metadata(&ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "owner metadata read failed; counters keep empty snapshots");
                HashMap::new()
            }
        }
    }

    /// Rebuild one day's daily counter from reference rows and refresh the
    /// owner snapshots for that day. `None` targets yesterday (UTC).
    pub async fn run_recompute(&self, date: Option<NaiveDate>) -> Result<RecomputeReport> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
        let channel = self.settings.recompute_channel.as_str();

        if !self.raw.is_configured() {
            info!(channel, %date, "raw source not configured; recompute skipped");
            return Ok(RecomputeReport::empty(SyncStatus::Skipped, date));
        }

        info!(channel, %date, "recompute started");
        match self.recompute_day(channel, date).await {
            Ok(report) => {
                match report.error.as_deref() {
                    None => info!(
                        channel,
                        %date,
                        rows = report.rows_scanned,
                        total = report.total,
                        owners_refreshed = report.owners_refreshed,
                        "recompute finished"
                    ),
                    Some(message) => {
                        warn!(
                            channel,
                            %date,
                            error = %message,
                            "owner refresh failed; daily counter kept"
                        );
                        checkpoint::record_failure(&self.pool, channel, message)
                            .await
                            .context("Failed to record failed checkpoint")?;
                    }
                }
                Ok(report)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(channel, %date, error = %message, "recompute failed");
                checkpoint::record_failure(&self.pool, channel, &message)
                    .await
                    .context("Failed to record failed checkpoint")?;
                let mut report = RecomputeReport::empty(SyncStatus::Failed, date);
                report.error = Some(message);
                Ok(report)
            }
        }
    }

    /// Overwrite the daily counter, then refresh owner names.
    ///
    /// The counter is committed before the raw source is consulted, so an
    /// owner refresh failure comes back as a `Failed` report with the fixed
    /// counter already in place.
    async fn recompute_day(&self, channel: &str, date: NaiveDate) -> Result<RecomputeReport> {
        let rows = reference::rows_for_date(&self.pool, date).await?;
        let tally = tally_reference_rows(&rows);

        let mut tx = self.pool.begin().await?;
        aggregate::replace_daily(&mut *tx, date, &tally).await?;
        tx.commit().await?;

        let mut report = RecomputeReport {
            status: SyncStatus::Success,
            date,
            rows_scanned: rows.len() as i64,
            total: tally.counts.total(),
            counts: tally.counts,
            active_owners: tally.active_owners,
            active_actors: tally.active_actors,
            owners_refreshed: 0,
            error: None,
        };

        match self.refresh_owners(channel, date, &rows).await {
            Ok(refreshed) => report.owners_refreshed = refreshed,
            Err(e) => {
                report.status = SyncStatus::Failed;
                report.error = Some(format!("{:#}", e));
            }
        }
        Ok(report)
    }

    /// Refresh cached owner names for `date` and record the successful run.
    async fn refresh_owners(
        &self,
        channel: &str,
        date: NaiveDate,
        rows: &[ReferenceRow],
    ) -> Result<i64> {
        let mut owner_ids: BTreeSet<i64> = rows.iter().filter_map(|r| r.owner_id).collect();
        owner_ids.extend(aggregate::owner_ids_for_date(&self.pool, date).await?);
        let owner_ids: Vec<i64> = owner_ids.into_iter().collect();

        let metadata = if owner_ids.is_empty() {
            HashMap::new()
        } else {
            self.raw
                .owner_metadata(&owner_ids)
                .await
                .context("Failed to read owner metadata")?
        };

        let mut tx = self.pool.begin().await?;
        let mut refreshed = 0i64;
        for owner_id in &owner_ids {
            let Some(meta) = metadata.get(owner_id) else {
                continue;
            };
            if aggregate::refresh_owner_snapshot(
                &mut *tx,
                date,
                *owner_id,
                meta.display_name.as_deref(),
                meta.namespace.as_deref(),
            )
            .await?
            {
                refreshed += 1;
            }
        }

        let stored_cursor = checkpoint::cursor(&mut *tx, channel).await?;
        checkpoint::record_success(&mut *tx, channel, stored_cursor, rows.len() as i64).await?;
        tx.commit().await?;
        Ok(refreshed)
    }

    pub async fn sync_status(&self) -> Result<SyncOverview> {
        Ok(SyncOverview {
            raw_source_configured: self.raw.is_configured(),
            incremental: checkpoint::get(&self.pool, &self.settings.incremental_channel).await?,
            recompute: checkpoint::get(&self.pool, &self.settings.recompute_channel).await?,
        })
    }
}

/// Counter deltas for one batch, grouped so each bucket is written once.
#[derive(Debug, Default)]
struct BatchFold {
    hourly: BTreeMap<(NaiveDate, u32), ModeCounts>,
    daily: BTreeMap<NaiveDate, DailyTally>,
    owners: BTreeMap<(NaiveDate, i64), ModeCounts>,
}

/// Group newly inserted rows into counter deltas.
///
/// Rows without a creation time have no bucket and are left out. Distinct
/// owner and actor counts include rows of every mode.
fn fold_batch(rows: &[(&RawRow, Classification)]) -> BatchFold {
    let mut fold = BatchFold::default();
    let mut distinct: BTreeMap<NaiveDate, (HashSet<i64>, HashSet<i64>)> = BTreeMap::new();

    for (row, class) in rows {
        let Some(created_at) = row.created_at else {
            continue;
        };
        let date = created_at.date();

        fold.hourly
            .entry((date, created_at.hour()))
            .or_default()
            .record(class.mode);
        fold.daily.entry(date).or_default().counts.record(class.mode);
        if let Some(owner_id) = class.owner_id {
            fold.owners
                .entry((date, owner_id))
                .or_default()
                .record(class.mode);
        }

        let (owners, actors) = distinct.entry(date).or_default();
        owners.extend(class.owner_id);
        actors.extend(row.actor_id);
    }

    for (date, (owners, actors)) in distinct {
        if let Some(tally) = fold.daily.get_mut(&date) {
            tally.active_owners = owners.len() as i64;
            tally.active_actors = actors.len() as i64;
        }
    }

    fold.hourly.retain(|_, counts| !counts.is_empty());
    fold.owners.retain(|_, counts| !counts.is_empty());
    fold
}

/// Authoritative tally of one day's reference rows.
pub fn tally_reference_rows(rows: &[ReferenceRow]) -> DailyTally {
    let mut tally = DailyTally::default();
    let mut owners = HashSet::new();
    let mut actors = HashSet::new();
    for row in rows {
        if let Some(mode) = row.injection_mode {
            tally.counts.record(mode);
        }
        owners.extend(row.owner_id);
        actors.extend(row.actor_id);
    }
    tally.active_owners = owners.len() as i64;
    tally.active_actors = actors.len() as i64;
    tally
}
