//! Test server lifecycle management
//!
//! Each test gets an isolated server on a random port with its own skill
//! database.

use skills_registry_server::coordinator::{RepairQueue, RetryConfig, SyncCoordinator};
use skills_registry_server::server::{make_app, ServerState};
use skills_registry_server::{
    BroadcastHub, ChangeLog, HashEmbedder, HubConfig, InMemorySearchIndex, SkillStore,
    SqliteSkillStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

const SERVER_READY_TIMEOUT_MS: u64 = 5000;
const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;

/// Test server instance with an isolated database.
///
/// When dropped, the server shuts down and temp resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    pub port: u16,

    _temp_db_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port and waits until it answers.
    pub async fn spawn() -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_db_dir.path().join("skills.db");

        let store = Arc::new(SqliteSkillStore::new(&db_path).expect("Failed to open skill store"));
        let replay = store.replay().expect("Failed to replay store");
        let changelog = Arc::new(ChangeLog::rebuild(&replay));
        let index = Arc::new(InMemorySearchIndex::new());
        let embedder = Arc::new(HashEmbedder::new());
        let repair_queue = Arc::new(RepairQueue::new());

        let hub = Arc::new(BroadcastHub::new(
            changelog.clone(),
            HubConfig {
                heartbeat_timeout: Duration::from_secs(30),
                retention: Duration::from_secs(60),
            },
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            store,
            index,
            embedder,
            changelog.clone(),
            repair_queue,
            RetryConfig {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
            },
        ));

        let state = ServerState {
            start_time: Instant::now(),
            coordinator,
            hub,
            changelog,
            hash: "test".to_string(),
        };

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = make_app(state);
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            _temp_db_dir: temp_db_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;
        server
    }

    /// Waits for the server to become ready by polling the health endpoint.
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
