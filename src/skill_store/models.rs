//! Skill store models.

use serde::{Deserialize, Serialize};

/// An immutable snapshot of a skill at one version.
///
/// Owned exclusively by the store once committed; never mutated afterwards.
/// A tombstone record marks a deleted skill and carries no content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Global commit sequence, gapless across all names, assigned by the
    /// store when the commit transaction lands. The change log uses it as
    /// the change sequence.
    pub seq: u64,
    pub name: String,
    /// Strictly increasing per name, starting at 1.
    pub version: u64,
    pub parent_version: Option<u64>,
    /// Hex SHA-256 of `content`.
    pub content_hash: String,
    pub content: Vec<u8>,
    pub description: String,
    pub tags: Vec<String>,
    pub author_id: String,
    pub tombstone: bool,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// Input for a single commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub name: String,
    pub content: Vec<u8>,
    pub description: String,
    pub tags: Vec<String>,
    pub author_id: String,
    /// Optimistic concurrency check: must equal the current latest version,
    /// or `None` when the name has no versions yet.
    pub expected_parent: Option<u64>,
}

/// One entry of the full commit-order history, used to rebuild the change
/// log and the search index on cold start.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub seq: u64,
    pub name: String,
    pub version: u64,
    pub tombstone: bool,
    pub created_at: i64,
}
