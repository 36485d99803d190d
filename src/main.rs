use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skills_registry_server::coordinator::{
    rebuild_search_index, run_repair_loop, RepairQueue, RetryConfig, SyncCoordinator,
};
use skills_registry_server::server::{run_server, ServerState};
use skills_registry_server::{
    BroadcastHub, ChangeLog, HashEmbedder, HubConfig, InMemorySearchIndex, SkillStore,
    SqliteSkillStore,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the SQLite skill database file.
    #[clap(value_parser = parse_path)]
    pub skill_db: PathBuf,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// Seconds without a heartbeat before a session counts as disconnected.
    #[clap(long, default_value_t = 60)]
    pub heartbeat_timeout_sec: u64,

    /// Seconds a disconnected session stays resumable before it is purged.
    #[clap(long, default_value_t = 300)]
    pub session_retention_sec: u64,

    /// Interval in seconds between session maintenance sweeps.
    #[clap(long, default_value_t = 10)]
    pub reaper_interval_sec: u64,

    /// Maximum embedding attempts per publish before degrading.
    #[clap(long, default_value_t = 3)]
    pub embed_max_attempts: u32,

    /// Base backoff in milliseconds between embedding attempts.
    #[clap(long, default_value_t = 100)]
    pub embed_backoff_ms: u64,

    /// Interval in seconds between background index repair passes.
    #[clap(long, default_value_t = 30)]
    pub repair_interval_sec: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    info!("Opening SQLite skill database at {:?}...", cli_args.skill_db);
    let store = Arc::new(SqliteSkillStore::new(&cli_args.skill_db)?);

    info!("Rebuilding change log from commit history...");
    let replay = store.replay()?;
    let changelog = Arc::new(ChangeLog::rebuild(&replay));
    info!("Change log tail is {}", changelog.tail());

    let index = Arc::new(InMemorySearchIndex::new());
    let embedder = Arc::new(HashEmbedder::new());
    let repair_queue = Arc::new(RepairQueue::new());

    info!("Indexing skills for search...");
    rebuild_search_index(
        store.as_ref(),
        index.as_ref(),
        embedder.as_ref(),
        repair_queue.as_ref(),
    )
    .await?;

    let hub = Arc::new(BroadcastHub::new(
        changelog.clone(),
        HubConfig {
            heartbeat_timeout: Duration::from_secs(cli_args.heartbeat_timeout_sec),
            retention: Duration::from_secs(cli_args.session_retention_sec),
        },
    ));

    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        index.clone(),
        embedder.clone(),
        changelog.clone(),
        repair_queue.clone(),
        RetryConfig {
            max_attempts: cli_args.embed_max_attempts,
            base_backoff: Duration::from_millis(cli_args.embed_backoff_ms),
        },
    ));

    tokio::spawn(run_repair_loop(
        repair_queue.clone(),
        store.clone(),
        index.clone(),
        embedder.clone(),
        Duration::from_secs(cli_args.repair_interval_sec),
    ));

    let reaper_hub = hub.clone();
    let reaper_interval = Duration::from_secs(cli_args.reaper_interval_sec);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;
        loop {
            ticker.tick().await;
            reaper_hub.reap();
        }
    });

    let state = ServerState {
        start_time: Instant::now(),
        coordinator,
        hub,
        changelog,
        hash: env!("GIT_HASH").to_string(),
    };

    info!("Ready to serve at port {}!", cli_args.port);
    run_server(state, cli_args.port).await
}
