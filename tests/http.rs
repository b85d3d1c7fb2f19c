use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Deserialize, PartialEq)]
struct ImageStats {
    views: u64,
    downloads: u64,
}

#[derive(Debug, Deserialize)]
struct SeriesStatsResponse {
    series: String,
    cached: bool,
    stats: BTreeMap<String, ImageStats>,
}

#[derive(Debug, Deserialize, Default)]
struct OptimisticQueue {
    views: BTreeMap<String, u64>,
    downloads: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct SeriesCacheInfo {
    series: String,
    count: usize,
    expired: bool,
}

#[derive(Debug, Deserialize)]
struct CacheInfo {
    series: Vec<SeriesCacheInfo>,
    optimistic_queue: OptimisticQueue,
}

struct TestServer {
    base_url: String,
    child: Child,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SERVER: Lazy<Mutex<Option<Arc<TestServer>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(unix)]
mod cleanup {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Once;

    static REGISTER: Once = Once::new();
    static PID: AtomicI32 = AtomicI32::new(0);

    pub fn register(pid: u32) {
        REGISTER.call_once(|| {
            PID.store(pid as i32, Ordering::SeqCst);
            unsafe {
                libc::atexit(on_exit);
            }
        });
    }

    extern "C" fn on_exit() {
        let pid = PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn unique_data_path() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!("wallpaper_stats_http_{}_{}.json", std::process::id(), nanos));
    path.to_string_lossy().to_string()
}

async fn wait_until_ready(base_url: &str) {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(resp) = client.get(format!("{base_url}/api/cache/info")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("server did not become ready");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn spawn_server() -> TestServer {
    let port = pick_free_port();
    let data_path = unique_data_path();
    let child = Command::new(env!("CARGO_BIN_EXE_wallpaper_stats"))
        .env("PORT", port.to_string())
        .env("STATS_CACHE_PATH", data_path)
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn server");

    #[cfg(unix)]
    cleanup::register(child.id());

    let base_url = format!("http://127.0.0.1:{port}");
    wait_until_ready(&base_url).await;

    TestServer { base_url, child }
}

async fn shared_server() -> Arc<TestServer> {
    let mut guard = SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Arc::clone(server);
    }
    let server = Arc::new(spawn_server().await);
    *guard = Some(Arc::clone(&server));
    server
}

async fn reset(client: &Client, base_url: &str) {
    let response = client
        .delete(format!("{base_url}/api/cache"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

async fn increment(client: &Client, base_url: &str, image_id: &str, kind: &str) -> StatusCode {
    client
        .post(format!("{base_url}/api/optimistic"))
        .json(&serde_json::json!({ "image_id": image_id, "kind": kind }))
        .send()
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn http_cached_stats_merge_with_optimistic_increments() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    reset(&client, &server.base_url).await;

    let response = client
        .put(format!("{}/api/stats/desktop", server.base_url))
        .json(&serde_json::json!({ "a": { "views": 10, "downloads": 2 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    for _ in 0..3 {
        assert!(increment(&client, &server.base_url, "a", "view").await.is_success());
    }
    assert!(increment(&client, &server.base_url, "b", "view").await.is_success());
    for _ in 0..5 {
        assert!(increment(&client, &server.base_url, "b", "download").await.is_success());
    }

    let merged: SeriesStatsResponse = client
        .get(format!("{}/api/stats/desktop", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(merged.series, "desktop");
    assert!(merged.cached);
    assert_eq!(merged.stats["a"], ImageStats { views: 13, downloads: 2 });
    assert_eq!(merged.stats["b"], ImageStats { views: 1, downloads: 5 });
}

#[tokio::test]
async fn http_uncached_series_reports_only_optimistic_counts() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    reset(&client, &server.base_url).await;

    assert!(increment(&client, &server.base_url, "x", "download").await.is_success());

    let merged: SeriesStatsResponse = client
        .get(format!("{}/api/stats/mobile", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(!merged.cached);
    assert_eq!(merged.stats.len(), 1);
    assert_eq!(merged.stats["x"], ImageStats { views: 0, downloads: 1 });
}

#[tokio::test]
async fn http_rejects_unknown_kind_and_empty_id() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    reset(&client, &server.base_url).await;

    assert_eq!(
        increment(&client, &server.base_url, "a", "share").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        increment(&client, &server.base_url, "  ", "view").await,
        StatusCode::BAD_REQUEST
    );

    let queue: OptimisticQueue = client
        .get(format!("{}/api/optimistic", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(queue.views.is_empty());
    assert!(queue.downloads.is_empty());
}

#[tokio::test]
async fn http_clearing_series_and_queue_is_scoped() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    reset(&client, &server.base_url).await;

    for series in ["desktop", "mobile"] {
        let response = client
            .put(format!("{}/api/stats/{series}", server.base_url))
            .json(&serde_json::json!({ "a": { "views": 1, "downloads": 1 } }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    assert!(increment(&client, &server.base_url, "a", "view").await.is_success());

    let response = client
        .delete(format!("{}/api/stats/mobile", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    for _ in 0..2 {
        let response = client
            .delete(format!("{}/api/optimistic", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let info: CacheInfo = client
        .get(format!("{}/api/cache/info", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(info.series.len(), 1);
    assert_eq!(info.series[0].series, "desktop");
    assert_eq!(info.series[0].count, 1);
    assert!(!info.series[0].expired);
    assert!(info.optimistic_queue.views.is_empty());
    assert!(info.optimistic_queue.downloads.is_empty());
}
