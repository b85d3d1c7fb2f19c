use crate::cache::StatsCache;
use crate::errors::AppError;
use crate::models::{
    CacheInfo, IncrementRequest, OptimisticQueue, SeriesStatsResponse, StatKind, StatsSnapshot,
};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tokio::task;

/// Runs a cache call that may hit the durable tier. Those writes go straight
/// to disk, so they run with the worker marked as blocking.
async fn with_durable<T>(state: &AppState, op: impl FnOnce(&mut StatsCache) -> T) -> T {
    let mut cache = state.cache.lock().await;
    task::block_in_place(|| op(&mut cache))
}

pub async fn get_series_stats(
    State(state): State<AppState>,
    Path(series): Path<String>,
) -> Json<SeriesStatsResponse> {
    let (cached, stats) = with_durable(&state, |cache| {
        // An expired or malformed entry is purged from disk here.
        let cached = cache.get_cached_stats(&series);
        let stats = cache.merge_with_optimistic(cached.as_ref().unwrap_or(&StatsSnapshot::new()));
        (cached, stats)
    })
    .await;

    Json(SeriesStatsResponse {
        series,
        cached: cached.is_some(),
        stats,
    })
}

pub async fn put_series_stats(
    State(state): State<AppState>,
    Path(series): Path<String>,
    Json(snapshot): Json<StatsSnapshot>,
) -> StatusCode {
    with_durable(&state, |cache| cache.set_cached_stats(&series, &snapshot)).await;
    StatusCode::NO_CONTENT
}

pub async fn delete_series_stats(
    State(state): State<AppState>,
    Path(series): Path<String>,
) -> StatusCode {
    with_durable(&state, |cache| cache.clear_series_cache(&series)).await;
    StatusCode::NO_CONTENT
}

pub async fn get_optimistic(State(state): State<AppState>) -> Json<OptimisticQueue> {
    Json(state.cache.lock().await.get_optimistic_queue())
}

pub async fn increment_optimistic(
    State(state): State<AppState>,
    Json(payload): Json<IncrementRequest>,
) -> Result<Json<OptimisticQueue>, AppError> {
    let image_id = payload.image_id.trim();
    if image_id.is_empty() {
        return Err(AppError::bad_request("image_id must not be empty"));
    }
    let kind: StatKind = payload
        .kind
        .trim()
        .parse()
        .map_err(|_| AppError::bad_request("kind must be 'view' or 'download'"))?;

    let mut cache = state.cache.lock().await;
    cache.increment_optimistic(image_id, kind);
    Ok(Json(cache.get_optimistic_queue()))
}

pub async fn clear_optimistic(State(state): State<AppState>) -> StatusCode {
    state.cache.lock().await.clear_optimistic_queue();
    StatusCode::NO_CONTENT
}

pub async fn clear_all(State(state): State<AppState>) -> StatusCode {
    with_durable(&state, StatsCache::clear_all_cache).await;
    StatusCode::NO_CONTENT
}

pub async fn cache_info(State(state): State<AppState>) -> Json<CacheInfo> {
    Json(state.cache.lock().await.get_cache_info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::ImageStats;
    use crate::storage::{FileStore, KeyValueStore, MemoryStore};
    use std::sync::Arc;

    async fn file_backed_state(dir: &tempfile::TempDir) -> AppState {
        let durable = FileStore::open(dir.path().join("cache.json")).await;
        AppState::new(StatsCache::new(
            Box::new(durable),
            Box::new(MemoryStore::new()),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn durable_writes_reach_disk_from_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let state = file_backed_state(&dir).await;

        let mut snapshot = StatsSnapshot::new();
        snapshot.insert("a".to_string(), ImageStats::new(4, 1));
        let status = put_series_stats(
            State(state.clone()),
            Path("desktop".to_string()),
            Json(snapshot),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let reopened = FileStore::open(dir.path().join("cache.json")).await;
        assert!(reopened.get("stats_desktop").unwrap().is_some());

        let Json(response) =
            get_series_stats(State(state.clone()), Path("desktop".to_string())).await;
        assert!(response.cached);
        assert_eq!(response.stats["a"], ImageStats::new(4, 1));

        assert_eq!(clear_all(State(state)).await, StatusCode::NO_CONTENT);
        let reopened = FileStore::open(dir.path().join("cache.json")).await;
        assert!(reopened.keys().unwrap().is_empty());
    }
}
