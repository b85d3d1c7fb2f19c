use crate::cache::StatsCache;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Mutex<StatsCache>>,
}

impl AppState {
    pub fn new(cache: StatsCache) -> Self {
        Self {
            cache: Arc::new(Mutex::new(cache)),
        }
    }
}
