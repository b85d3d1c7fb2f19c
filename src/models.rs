use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageStats {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub downloads: u64,
}

impl ImageStats {
    pub fn new(views: u64, downloads: u64) -> Self {
        Self { views, downloads }
    }
}

/// Canonical per-image statistics for one series.
pub type StatsSnapshot = BTreeMap<String, ImageStats>;

/// Snapshot with the optimistic deltas folded in.
pub type MergedStats = BTreeMap<String, ImageStats>;

/// Durable value stored under `stats_<series>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Vec<(String, ImageStats)>,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn new(snapshot: &StatsSnapshot, fetched_at: i64) -> Self {
        Self {
            data: snapshot
                .iter()
                .map(|(id, stats)| (id.clone(), *stats))
                .collect(),
            timestamp: fetched_at,
        }
    }

    pub fn into_snapshot(self) -> StatsSnapshot {
        self.data.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OptimisticQueue {
    #[serde(default)]
    pub views: BTreeMap<String, u64>,
    #[serde(default)]
    pub downloads: BTreeMap<String, u64>,
}

impl OptimisticQueue {
    pub fn is_empty(&self) -> bool {
        self.views.is_empty() && self.downloads.is_empty()
    }

    pub fn counts_mut(&mut self, kind: StatKind) -> &mut BTreeMap<String, u64> {
        match kind {
            StatKind::View => &mut self.views,
            StatKind::Download => &mut self.downloads,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    View,
    Download,
}

impl FromStr for StatKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "view" => Ok(Self::View),
            "download" => Ok(Self::Download),
            other => Err(format!("unknown stat kind '{other}'")),
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View => f.write_str("view"),
            Self::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesCacheInfo {
    pub series: String,
    pub count: usize,
    pub age_minutes: i64,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct CacheInfo {
    pub series: Vec<SeriesCacheInfo>,
    pub optimistic_queue: OptimisticQueue,
}

#[derive(Debug, Deserialize)]
pub struct IncrementRequest {
    pub image_id: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct SeriesStatsResponse {
    pub series: String,
    pub cached: bool,
    pub stats: MergedStats,
}
