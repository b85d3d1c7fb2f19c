//! Statistics cache: a TTL-bounded durable snapshot per series plus a
//! session-scoped queue of optimistic increments.
//!
//! Every public operation is fail-open. Storage and decoding problems are
//! logged and turn into "absent" or "no-op"; the `try_*` variants keep the
//! underlying [`CacheError`] for callers that want it.

use crate::clock::Clock;
use crate::errors::{CacheError, StorageError};
use crate::models::{
    CacheEntry, CacheInfo, MergedStats, OptimisticQueue, SeriesCacheInfo, StatKind, StatsSnapshot,
};
use crate::stats::merge_stats;
use crate::storage::KeyValueStore;
use std::{sync::Arc, time::Duration};
use tracing::warn;

pub const CACHE_PREFIX: &str = "stats_";
pub const OPTIMISTIC_KEY: &str = "stats_optimistic";
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

const MS_PER_MINUTE: i64 = 60 * 1000;

pub fn series_key(series: &str) -> String {
    format!("{CACHE_PREFIX}{series}")
}

pub struct StatsCache {
    durable: Box<dyn KeyValueStore>,
    session: Box<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
}

impl StatsCache {
    pub fn new(
        durable: Box<dyn KeyValueStore>,
        session: Box<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_ttl(durable, session, clock, DEFAULT_TTL)
    }

    pub fn with_ttl(
        durable: Box<dyn KeyValueStore>,
        session: Box<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            durable,
            session,
            clock,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn get_cached_stats(&mut self, series: &str) -> Option<StatsSnapshot> {
        match self.try_get_cached_stats(series) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(series, "cached stats unavailable: {err}");
                None
            }
        }
    }

    /// Missing entries are `Ok(None)`. Expired and malformed entries are
    /// removed from the durable tier before the error is returned.
    pub fn try_get_cached_stats(
        &mut self,
        series: &str,
    ) -> Result<Option<StatsSnapshot>, CacheError> {
        let key = series_key(series);
        let Some(raw) = self.durable.get(&key)? else {
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(source) => {
                self.purge(&key);
                return Err(CacheError::Malformed { key, source });
            }
        };

        let age_ms = self.clock.now_ms().saturating_sub(entry.timestamp);
        if age_ms > self.ttl_ms {
            self.purge(&key);
            return Err(CacheError::Expired { key, age_ms });
        }

        Ok(Some(entry.into_snapshot()))
    }

    fn purge(&mut self, key: &str) {
        if let Err(err) = self.durable.remove(key) {
            warn!(key, "failed to purge cache entry: {err}");
        }
    }

    pub fn set_cached_stats(&mut self, series: &str, snapshot: &StatsSnapshot) {
        if let Err(err) = self.try_set_cached_stats(series, snapshot) {
            warn!(series, "failed to write cached stats: {err}");
        }
    }

    pub fn try_set_cached_stats(
        &mut self,
        series: &str,
        snapshot: &StatsSnapshot,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(snapshot, self.clock.now_ms());
        let payload = serde_json::to_string(&entry).map_err(CacheError::Encode)?;
        self.durable.set(&series_key(series), payload)?;
        Ok(())
    }

    pub fn clear_series_cache(&mut self, series: &str) {
        if let Err(err) = self.durable.remove(&series_key(series)) {
            warn!(series, "failed to clear cached stats: {err}");
        }
    }

    pub fn clear_all_cache(&mut self) {
        if let Err(err) = self.try_clear_all_cache() {
            warn!("failed to clear stats cache: {err}");
        }
    }

    /// Removes every series entry and the optimistic queue. A failed removal
    /// does not stop the rest; the first error is returned afterwards.
    pub fn try_clear_all_cache(&mut self) -> Result<(), CacheError> {
        let mut first_err: Option<StorageError> = None;

        match self.durable.keys() {
            Ok(keys) => {
                for key in keys.iter().filter(|key| key.starts_with(CACHE_PREFIX)) {
                    if let Err(err) = self.durable.remove(key) {
                        warn!(key = key.as_str(), "failed to remove cache entry: {err}");
                        first_err.get_or_insert(err);
                    }
                }
            }
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = self.session.remove(OPTIMISTIC_KEY) {
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn get_optimistic_queue(&self) -> OptimisticQueue {
        match self.try_get_optimistic_queue() {
            Ok(queue) => queue,
            Err(err) => {
                warn!("optimistic queue unreadable: {err}");
                OptimisticQueue::default()
            }
        }
    }

    pub fn try_get_optimistic_queue(&self) -> Result<OptimisticQueue, CacheError> {
        let Some(raw) = self.session.get(OPTIMISTIC_KEY)? else {
            return Ok(OptimisticQueue::default());
        };
        serde_json::from_str(&raw).map_err(|source| CacheError::Malformed {
            key: OPTIMISTIC_KEY.to_string(),
            source,
        })
    }

    pub fn increment_optimistic(&mut self, image_id: &str, kind: StatKind) {
        if let Err(err) = self.try_increment_optimistic(image_id, kind) {
            warn!(image_id, %kind, "failed to record optimistic increment: {err}");
        }
    }

    /// Read-modify-write of the whole queue. A malformed queue is replaced by
    /// a fresh one; a failed read leaves the stored queue untouched.
    pub fn try_increment_optimistic(
        &mut self,
        image_id: &str,
        kind: StatKind,
    ) -> Result<(), CacheError> {
        let mut queue = match self.try_get_optimistic_queue() {
            Ok(queue) => queue,
            Err(err @ CacheError::Malformed { .. }) => {
                warn!("replacing malformed optimistic queue: {err}");
                OptimisticQueue::default()
            }
            Err(err) => return Err(err),
        };
        let count = queue.counts_mut(kind).entry(image_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        let payload = serde_json::to_string(&queue).map_err(CacheError::Encode)?;
        self.session.set(OPTIMISTIC_KEY, payload)?;
        Ok(())
    }

    pub fn clear_optimistic_queue(&mut self) {
        if let Err(err) = self.session.remove(OPTIMISTIC_KEY) {
            warn!("failed to clear optimistic queue: {err}");
        }
    }

    pub fn merge_with_optimistic(&self, snapshot: &StatsSnapshot) -> MergedStats {
        merge_stats(snapshot, &self.get_optimistic_queue())
    }

    /// Diagnostic view of every cached series. Never mutates either tier;
    /// malformed entries are skipped.
    pub fn get_cache_info(&self) -> CacheInfo {
        let mut info = CacheInfo {
            series: Vec::new(),
            optimistic_queue: self.get_optimistic_queue(),
        };

        let keys = match self.durable.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!("failed to list cached series: {err}");
                return info;
            }
        };

        let now = self.clock.now_ms();
        for key in keys {
            let Some(series) = key.strip_prefix(CACHE_PREFIX) else {
                continue;
            };
            let raw = match self.durable.get(&key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    warn!(series, "failed to read cached stats: {err}");
                    continue;
                }
            };
            let entry: CacheEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(series, "skipping malformed cache entry: {err}");
                    continue;
                }
            };

            let age_ms = now.saturating_sub(entry.timestamp);
            info.series.push(SeriesCacheInfo {
                series: series.to_string(),
                count: entry.data.len(),
                age_minutes: rounded_minutes(age_ms),
                expired: age_ms > self.ttl_ms,
            });
        }

        info
    }
}

fn rounded_minutes(age_ms: i64) -> i64 {
    (age_ms as f64 / MS_PER_MINUTE as f64).round() as i64
}
