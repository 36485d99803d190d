//! Background repair of degraded index entries.

use crate::search_index::{embed_document, Embedder, IndexEntry, SearchIndex};
use crate::skill_store::SkillStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Names whose index entry is known to lag the store.
#[derive(Default)]
pub struct RepairQueue {
    pending: Mutex<HashSet<String>>,
    notify: Notify,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, name: &str) {
        self.pending.lock().unwrap().insert(name.to_string());
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<String> {
        self.pending.lock().unwrap().drain().collect()
    }
}

/// Re-index every scheduled name until the index matches the store.
///
/// Runs forever; names whose repair fails again go back on the queue and are
/// retried on the next pass.
pub async fn run_repair_loop(
    queue: Arc<RepairQueue>,
    store: Arc<dyn SkillStore>,
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = queue.notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        repair_pass(&queue, store.as_ref(), index.as_ref(), embedder.as_ref()).await;
    }
}

pub async fn repair_pass(
    queue: &RepairQueue,
    store: &dyn SkillStore,
    index: &dyn SearchIndex,
    embedder: &dyn Embedder,
) {
    let names = queue.drain();
    if names.is_empty() {
        return;
    }
    info!("Repairing {} degraded index entries", names.len());
    for name in names {
        match store.get(&name, None) {
            Ok(record) => match embedder.embed(&embed_document(&record)).await {
                Ok(embedding) => {
                    index.upsert(IndexEntry {
                        name: record.name.clone(),
                        version: record.version,
                        embedding,
                        description: record.description.clone(),
                        tags: record.tags.clone(),
                    });
                }
                Err(e) => {
                    warn!("Repair of {} failed, will retry: {:#}", name, e);
                    queue.schedule(&name);
                }
            },
            // Deleted while degraded: make sure nothing stale lingers.
            Err(crate::error::RegistryError::NotFound(_)) => {
                index.remove(&name, u64::MAX);
            }
            Err(e) => {
                warn!("Repair of {} could not read the store: {}", name, e);
                queue.schedule(&name);
            }
        }
    }
}
