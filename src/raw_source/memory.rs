//! In-memory [`RawSource`] for tests and local experiments.
//!
//! Rows, extracted texts, owner metadata, and actor names live behind
//! `std::sync::RwLock`. Failures can be injected to exercise the failed
//! checkpoint and failed row paths. The state is plain data, so a poisoned
//! lock is recovered rather than propagated.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{RawRow, RawSource};
use crate::payload::OwnerMetadata;

#[derive(Default)]
struct Failures {
    next_cursor_read: Option<String>,
    detail_ids: HashSet<i64>,
    owner_metadata: Option<String>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct InMemoryRawSource {
    rows: RwLock<Vec<RawRow>>,
    texts: RwLock<HashMap<i64, String>>,
    owners: RwLock<HashMap<i64, OwnerMetadata>>,
    actors: RwLock<HashMap<i64, String>>,
    failures: RwLock<Failures>,
}

impl InMemoryRawSource {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            texts: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            actors: RwLock::new(HashMap::new()),
            failures: RwLock::new(Failures::default()),
        }
    }

    /// Add or replace a row (keyed by id).
    pub fn push_row(&self, row: RawRow) {
        let mut rows = write(&self.rows);
        rows.retain(|r| r.id != row.id);
        rows.push(row);
        rows.sort_by_key(|r| r.id);
    }

    pub fn set_extracted_text(&self, id: i64, text: &str) {
        write(&self.texts).insert(id, text.to_string());
    }

    pub fn set_owner(&self, meta: OwnerMetadata) {
        write(&self.owners).insert(meta.owner_id, meta);
    }

    pub fn set_actor_name(&self, id: i64, name: &str) {
        write(&self.actors).insert(id, name.to_string());
    }

    /// Make the next [`rows_after`](RawSource::rows_after) call fail.
    pub fn fail_next_cursor_read(&self, message: &str) {
        write(&self.failures).next_cursor_read = Some(message.to_string());
    }

    /// Make every detail read that includes `id` fail.
    pub fn fail_detail_for(&self, id: i64) {
        write(&self.failures).detail_ids.insert(id);
    }

    /// Make every owner metadata read fail until cleared.
    pub fn fail_owner_metadata(&self, message: Option<&str>) {
        write(&self.failures).owner_metadata = message.map(str::to_string);
    }
}

impl Default for InMemoryRawSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawSource for InMemoryRawSource {
    async fn rows_after(&self, cursor: i64, limit: usize) -> Result<Vec<RawRow>> {
        if let Some(message) = write(&self.failures).next_cursor_read.take() {
            bail!(message);
        }
        let rows = read(&self.rows);
        Ok(rows
            .iter()
            .filter(|r| r.id > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn rows_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, RawRow>> {
        {
            let failures = read(&self.failures);
            if let Some(id) = ids.iter().find(|id| failures.detail_ids.contains(id)) {
                bail!("raw detail read failed for id {}", id);
            }
        }
        let rows = read(&self.rows);
        Ok(rows
            .iter()
            .filter(|r| ids.contains(&r.id))
            .map(|r| (r.id, r.clone()))
            .collect())
    }

    async fn extracted_text(&self, id: i64) -> Result<Option<String>> {
        Ok(read(&self.texts).get(&id).cloned())
    }

    async fn owner_metadata(&self, owner_ids: &[i64]) -> Result<HashMap<i64, OwnerMetadata>> {
        if let Some(message) = read(&self.failures).owner_metadata.clone() {
            bail!(message);
        }
        let owners = read(&self.owners);
        Ok(owner_ids
            .iter()
            .filter_map(|id| owners.get(id).map(|m| (*id, m.clone())))
            .collect())
    }

    async fn actor_names(&self, actor_ids: &[i64]) -> Result<HashMap<i64, String>> {
        let actors = read(&self.actors);
        Ok(actor_ids
            .iter()
            .filter_map(|id| actors.get(id).map(|n| (*id, n.clone())))
            .collect())
    }
}
