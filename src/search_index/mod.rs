//! Semantic search over live skills.
//!
//! The index is a derived view: the skill store is the source of truth and
//! the index can always be rebuilt from it. Upserts carry the version they
//! were computed from so late-arriving work for an older version is dropped
//! instead of clobbering a newer entry.

mod embedder;
mod memory_index;

pub use embedder::{embed_document, Embedder, HashEmbedder};
pub use memory_index::InMemorySearchIndex;

/// One indexed skill, always the latest version the index has seen.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub name: String,
    pub version: u64,
    pub embedding: Vec<f32>,
    pub description: String,
    pub tags: Vec<String>,
}

/// Result of an upsert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The index already holds this exact version.
    Unchanged,
    /// The index holds a newer version; the upsert was dropped.
    RejectedStale,
}

/// A single search result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub name: String,
    pub version: u64,
    pub score: f32,
    pub description: String,
    pub tags: Vec<String>,
}

pub trait SearchIndex: Send + Sync {
    /// Insert or replace the entry for `entry.name`, unless the index
    /// already holds a newer version.
    fn upsert(&self, entry: IndexEntry) -> UpsertOutcome;

    /// Remove the entry for `name` if its indexed version is at or below
    /// `version`. Returns whether an entry was removed.
    fn remove(&self, name: &str, version: u64) -> bool;

    /// Top-k entries by cosine similarity to `embedding`, optionally
    /// restricted to entries carrying all of `tag_filter`.
    fn query(&self, embedding: &[f32], top_k: usize, tag_filter: &[String]) -> Vec<SearchHit>;

    fn get(&self, name: &str) -> Option<IndexEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
