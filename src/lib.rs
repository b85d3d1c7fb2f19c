pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod stats;
pub mod storage;
pub mod state;

pub use app::router;
pub use cache::StatsCache;
pub use config::Config;
pub use state::AppState;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
