//! In-memory vector index.

use super::{IndexEntry, SearchHit, SearchIndex, UpsertOutcome};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// RwLock-protected map from skill name to its latest indexed entry.
///
/// Queries do a full scan; at registry scale (thousands of skills, not
/// millions) this beats maintaining an ANN structure.
#[derive(Default)]
pub struct InMemorySearchIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl SearchIndex for InMemorySearchIndex {
    fn upsert(&self, entry: IndexEntry) -> UpsertOutcome {
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&entry.name) {
            if existing.version > entry.version {
                debug!(
                    "Dropping stale index upsert for {} v{} (indexed v{})",
                    entry.name, entry.version, existing.version
                );
                return UpsertOutcome::RejectedStale;
            }
            if existing.version == entry.version {
                return UpsertOutcome::Unchanged;
            }
        }
        entries.insert(entry.name.clone(), entry);
        UpsertOutcome::Applied
    }

    fn remove(&self, name: &str, version: u64) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get(name) {
            Some(existing) if existing.version <= version => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    fn query(&self, embedding: &[f32], top_k: usize, tag_filter: &[String]) -> Vec<SearchHit> {
        let entries = self.entries.read().unwrap();
        let mut hits: Vec<SearchHit> = entries
            .values()
            .filter(|e| tag_filter.iter().all(|t| e.tags.contains(t)))
            .map(|e| SearchHit {
                name: e.name.clone(),
                version: e.version,
                score: cosine_similarity(embedding, &e.embedding),
                description: e.description.clone(),
                tags: e.tags.clone(),
            })
            .collect();
        // Deterministic order: score descending, name as tiebreak.
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.name.cmp(&b.name))
        });
        hits.truncate(top_k);
        hits
    }

    fn get(&self, name: &str) -> Option<IndexEntry> {
        self.entries.read().unwrap().get(name).cloned()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}
