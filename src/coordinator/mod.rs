//! Orchestration of commits across store, index, change log and hub.
//!
//! The write path is commit-then-continue: the store commit happens inline,
//! everything after it (embedding, index update, change log append) runs in
//! a detached task so a caller disconnecting mid-request can never leave a
//! durable commit unannounced.

mod repair;

pub use repair::{repair_pass, run_repair_loop, RepairQueue};

use crate::changelog::{ChangeKind, ChangeLog, ChangeRecord};
use crate::error::RegistryError;
use crate::search_index::{embed_document, Embedder, IndexEntry, SearchHit, SearchIndex};
use crate::skill_store::{CommitRequest, SkillStore, VersionRecord};
use anyhow::anyhow;
use rand::Rng as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// The result of a completed publish or delete.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub record: VersionRecord,
    pub change: ChangeRecord,
}

pub struct SyncCoordinator {
    store: Arc<dyn SkillStore>,
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    changelog: Arc<ChangeLog>,
    repair_queue: Arc<RepairQueue>,
    retry: RetryConfig,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn SkillStore>,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        changelog: Arc<ChangeLog>,
        repair_queue: Arc<RepairQueue>,
        retry: RetryConfig,
    ) -> Self {
        SyncCoordinator {
            store,
            index,
            embedder,
            changelog,
            repair_queue,
            retry,
        }
    }

    /// Commit a new version and announce it.
    ///
    /// Fails fast on a stale parent; there is no internal retry of the
    /// commit itself. Once the commit is durable the announcement cannot be
    /// cancelled by the caller.
    pub async fn publish(&self, req: CommitRequest) -> Result<PublishOutcome, RegistryError> {
        if self.changelog.is_halted() {
            return Err(RegistryError::LogHalted);
        }
        let record = self.store.commit(req)?;

        let kind = if record.version == 1 {
            ChangeKind::Created
        } else {
            ChangeKind::Updated
        };
        let handle = tokio::spawn(finish_publish(
            record.clone(),
            kind,
            self.index.clone(),
            self.embedder.clone(),
            self.changelog.clone(),
            self.repair_queue.clone(),
            self.retry,
        ));
        let change = self.await_continuation(handle, "publish").await?;
        Ok(PublishOutcome { record, change })
    }

    /// Tombstone a skill and announce the deletion.
    pub async fn delete(&self, name: &str, author_id: &str) -> Result<PublishOutcome, RegistryError> {
        if self.changelog.is_halted() {
            return Err(RegistryError::LogHalted);
        }
        let record = self.store.delete(name, author_id)?;

        let index = self.index.clone();
        let changelog = self.changelog.clone();
        let tombstone = record.clone();
        let handle = tokio::spawn(async move {
            index.remove(&tombstone.name, tombstone.version);
            changelog.append(
                tombstone.seq,
                ChangeKind::Deleted,
                &tombstone.name,
                tombstone.version,
                false,
                tombstone.created_at,
            )
        });
        let change = self.await_continuation(handle, "delete").await?;
        Ok(PublishOutcome { record, change })
    }

    /// A continuation that dies leaves its commit sequence unannounced and
    /// the log stuck at the gap, so losing one halts the log.
    async fn await_continuation(
        &self,
        handle: tokio::task::JoinHandle<Result<ChangeRecord, RegistryError>>,
        what: &str,
    ) -> Result<ChangeRecord, RegistryError> {
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                self.changelog
                    .halt("continuation lost after a durable commit");
                Err(RegistryError::Internal(anyhow!(
                    "{} continuation panicked: {}",
                    what,
                    e
                )))
            }
        }
    }

    /// Semantic search over live skills.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        tags: &[String],
    ) -> Result<Vec<SearchHit>, RegistryError> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(RegistryError::Internal)?;
        Ok(self.index.query(&embedding, top_k, tags))
    }

    pub fn store(&self) -> &Arc<dyn SkillStore> {
        &self.store
    }

    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    pub fn degraded_count(&self) -> usize {
        self.repair_queue.len()
    }
}

/// The detached half of a publish: index the new version, then append to
/// the change log. An embedding failure degrades the change instead of
/// failing it; an append failure halts the log.
async fn finish_publish(
    record: VersionRecord,
    kind: ChangeKind,
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    changelog: Arc<ChangeLog>,
    repair_queue: Arc<RepairQueue>,
    retry: RetryConfig,
) -> Result<ChangeRecord, RegistryError> {
    let degraded = match embed_with_retry(embedder.as_ref(), &embed_document(&record), retry).await
    {
        Ok(embedding) => {
            index.upsert(IndexEntry {
                name: record.name.clone(),
                version: record.version,
                embedding,
                description: record.description.clone(),
                tags: record.tags.clone(),
            });
            false
        }
        Err(e) => {
            warn!(
                "Indexing {} v{} failed, publishing degraded: {:#}",
                record.name, record.version, e
            );
            repair_queue.schedule(&record.name);
            true
        }
    };

    match changelog.append(
        record.seq,
        kind,
        &record.name,
        record.version,
        degraded,
        record.created_at,
    ) {
        Ok(change) => {
            info!(
                "Published {} v{} as change {}{}",
                record.name,
                record.version,
                change.sequence,
                if degraded { " (degraded)" } else { "" }
            );
            Ok(change)
        }
        Err(e) => {
            changelog.halt("change log append failed after a durable commit");
            Err(e)
        }
    }
}

async fn embed_with_retry(
    embedder: &dyn Embedder,
    text: &str,
    retry: RetryConfig,
) -> anyhow::Result<Vec<f32>> {
    let mut last_err = None;
    for attempt in 0..retry.max_attempts {
        match embedder.embed(text).await {
            Ok(embedding) => return Ok(embedding),
            Err(e) => {
                if attempt + 1 < retry.max_attempts {
                    let backoff = retry.base_backoff * 2u32.pow(attempt);
                    let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 2);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("embedding failed")))
}

/// Cold-start rebuild: embed the latest version of every live skill.
/// Skills whose embedding fails are left to the repair loop.
pub async fn rebuild_search_index(
    store: &dyn SkillStore,
    index: &dyn SearchIndex,
    embedder: &dyn Embedder,
    repair_queue: &RepairQueue,
) -> Result<(), RegistryError> {
    let records = store.latest_records()?;
    let total = records.len();
    for record in records {
        match embedder.embed(&embed_document(&record)).await {
            Ok(embedding) => {
                index.upsert(IndexEntry {
                    name: record.name.clone(),
                    version: record.version,
                    embedding,
                    description: record.description,
                    tags: record.tags,
                });
            }
            Err(e) => {
                warn!("Could not index {} during rebuild: {:#}", record.name, e);
                repair_queue.schedule(&record.name);
            }
        }
    }
    info!("Search index rebuilt: {} skills", total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_index::{HashEmbedder, InMemorySearchIndex};
    use crate::skill_store::SqliteSkillStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails the first `failures` embed calls, then delegates.
    struct FlakyEmbedder {
        failures: AtomicU32,
        inner: HashEmbedder,
    }

    impl FlakyEmbedder {
        fn new(failures: u32) -> Self {
            FlakyEmbedder {
                failures: AtomicU32::new(failures),
                inner: HashEmbedder::new(),
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("embedding backend unavailable");
            }
            self.inner.embed(text).await
        }
    }

    /// Stalls any embed whose document mentions "slow"; instant otherwise.
    struct SlowEmbedder {
        delay: Duration,
        inner: HashEmbedder,
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            if text.contains("slow") {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.embed(text).await
        }
    }

    struct Fixture {
        _dir: TempDir,
        coordinator: SyncCoordinator,
        index: Arc<InMemorySearchIndex>,
        changelog: Arc<ChangeLog>,
        repair_queue: Arc<RepairQueue>,
        store: Arc<SqliteSkillStore>,
        embedder: Arc<dyn Embedder>,
    }

    fn make_fixture(embedder: Arc<dyn Embedder>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteSkillStore::new(dir.path().join("skills.db")).unwrap());
        let index = Arc::new(InMemorySearchIndex::new());
        let changelog = Arc::new(ChangeLog::new());
        let repair_queue = Arc::new(RepairQueue::new());
        let retry = RetryConfig {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        };
        let coordinator = SyncCoordinator::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            changelog.clone(),
            repair_queue.clone(),
            retry,
        );
        Fixture {
            _dir: dir,
            coordinator,
            index,
            changelog,
            repair_queue,
            store,
            embedder,
        }
    }

    fn publish_req(name: &str, description: &str, tags: &[&str], parent: Option<u64>) -> CommitRequest {
        CommitRequest {
            name: name.to_string(),
            content: format!("content of {}", name).into_bytes(),
            description: description.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            author_id: "agent-a".to_string(),
            expected_parent: parent,
        }
    }

    #[tokio::test]
    async fn publish_commits_indexes_and_logs() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        let outcome = f
            .coordinator
            .publish(publish_req("excel_analyzer", "Analyze spreadsheets", &["excel"], None))
            .await
            .unwrap();

        assert_eq!(outcome.record.version, 1);
        assert_eq!(outcome.change.sequence, 1);
        assert_eq!(outcome.change.kind, ChangeKind::Created);
        assert!(!outcome.change.degraded);
        assert_eq!(f.index.get("excel_analyzer").unwrap().version, 1);
        assert_eq!(f.changelog.tail(), 1);
    }

    #[tokio::test]
    async fn stale_parent_fails_without_logging_a_change() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        f.coordinator
            .publish(publish_req("tool", "v1", &[], None))
            .await
            .unwrap();

        let err = f
            .coordinator
            .publish(publish_req("tool", "stale", &[], None))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        assert_eq!(f.changelog.tail(), 1);
    }

    #[tokio::test]
    async fn concurrent_publishes_to_one_name_serialize() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        f.coordinator
            .publish(publish_req("tool", "v1", &[], None))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            f.coordinator.publish(publish_req("tool", "left", &[], Some(1))),
            f.coordinator.publish(publish_req("tool", "right", &[], Some(1))),
        );
        // Exactly one wins the compare-and-swap.
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(f.store.get("tool", None).unwrap().version, 2);
        assert_eq!(f.changelog.tail(), 2);
    }

    #[tokio::test]
    async fn change_order_follows_commit_order_under_slow_indexing() {
        let f = make_fixture(Arc::new(SlowEmbedder {
            delay: Duration::from_millis(150),
            inner: HashEmbedder::new(),
        }));

        // v1's indexing stalls; v2 commits and indexes while v1 is still
        // embedding. The feed must still show v1 before v2.
        let (first, second) = tokio::join!(
            f.coordinator
                .publish(publish_req("tool", "slow to index", &[], None)),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.coordinator
                    .publish(publish_req("tool", "indexes right away", &[], Some(1)))
                    .await
            },
        );
        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!((first.change.sequence, first.record.version), (1, 1));
        assert_eq!((second.change.sequence, second.record.version), (2, 2));

        let order: Vec<(u64, u64)> = f
            .changelog
            .read_from(0, 10)
            .iter()
            .map(|r| (r.sequence, r.version))
            .collect();
        assert_eq!(order, vec![(1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn delete_removes_from_index_and_logs_deletion() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        f.coordinator
            .publish(publish_req("tool", "v1", &[], None))
            .await
            .unwrap();

        let outcome = f.coordinator.delete("tool", "agent-b").await.unwrap();
        assert!(outcome.record.tombstone);
        assert_eq!(outcome.change.kind, ChangeKind::Deleted);
        assert!(f.index.get("tool").is_none());
        // History survives the delete.
        assert_eq!(f.store.history("tool").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn embedding_failure_degrades_instead_of_failing() {
        // More failures than retry attempts.
        let f = make_fixture(Arc::new(FlakyEmbedder::new(10)));
        let outcome = f
            .coordinator
            .publish(publish_req("tool", "v1", &[], None))
            .await
            .unwrap();

        assert!(outcome.change.degraded);
        assert!(f.index.get("tool").is_none());
        assert_eq!(f.coordinator.degraded_count(), 1);
        // The commit is durable regardless.
        assert_eq!(f.store.get("tool", None).unwrap().version, 1);
    }

    #[tokio::test]
    async fn repair_converges_degraded_entries() {
        let flaky = Arc::new(FlakyEmbedder::new(10));
        let f = make_fixture(flaky.clone());
        f.coordinator
            .publish(publish_req("tool", "v1", &["data"], None))
            .await
            .unwrap();
        assert_eq!(f.coordinator.degraded_count(), 1);

        // Backend recovered.
        flaky.failures.store(0, Ordering::SeqCst);
        repair_pass(
            &f.repair_queue,
            f.store.as_ref(),
            f.index.as_ref(),
            f.embedder.as_ref(),
        )
        .await;

        assert_eq!(f.coordinator.degraded_count(), 0);
        assert_eq!(f.index.get("tool").unwrap().version, 1);
    }

    #[tokio::test]
    async fn search_finds_the_matching_skill() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        f.coordinator
            .publish(publish_req(
                "excel_analyzer",
                "Analyze excel spreadsheets and extract data",
                &["excel", "data"],
                None,
            ))
            .await
            .unwrap();
        f.coordinator
            .publish(publish_req("irc_client", "Chat over irc", &["chat"], None))
            .await
            .unwrap();

        let hits = f
            .coordinator
            .search("analyze excel spreadsheets", 5, &[])
            .await
            .unwrap();
        assert_eq!(hits[0].name, "excel_analyzer");

        let tagged = f
            .coordinator
            .search("anything", 5, &["chat".to_string()])
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].name, "irc_client");
    }

    #[tokio::test]
    async fn halted_log_rejects_writes() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        f.coordinator
            .publish(publish_req("tool", "v1", &[], None))
            .await
            .unwrap();
        f.changelog.halt("test");

        assert!(matches!(
            f.coordinator
                .publish(publish_req("tool", "v2", &[], Some(1)))
                .await,
            Err(RegistryError::LogHalted)
        ));
        assert!(matches!(
            f.coordinator.delete("tool", "x").await,
            Err(RegistryError::LogHalted)
        ));
    }

    #[tokio::test]
    async fn rebuild_indexes_every_live_skill() {
        let f = make_fixture(Arc::new(HashEmbedder::new()));
        f.coordinator
            .publish(publish_req("keep", "stays", &[], None))
            .await
            .unwrap();
        f.coordinator
            .publish(publish_req("drop", "goes", &[], None))
            .await
            .unwrap();
        f.coordinator.delete("drop", "x").await.unwrap();

        let fresh = InMemorySearchIndex::new();
        rebuild_search_index(
            f.store.as_ref(),
            &fresh,
            f.embedder.as_ref(),
            &f.repair_queue,
        )
        .await
        .unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh.get("keep").is_some());
    }
}
