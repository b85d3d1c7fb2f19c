use crate::handlers;
use crate::state::AppState;
use axum::{routing::{delete, get}, Router};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/stats/:series",
            get(handlers::get_series_stats)
                .put(handlers::put_series_stats)
                .delete(handlers::delete_series_stats),
        )
        .route(
            "/api/optimistic",
            get(handlers::get_optimistic)
                .post(handlers::increment_optimistic)
                .delete(handlers::clear_optimistic),
        )
        .route("/api/cache", delete(handlers::clear_all))
        .route("/api/cache/info", get(handlers::cache_info))
        .with_state(state)
}
