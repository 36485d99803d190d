//! SkillStore trait definition.

use crate::error::RegistryError;

use super::models::{CommitRequest, ReplayEntry, VersionRecord};

/// Trait for versioned skill storage backends.
///
/// Any store offering atomic append-with-parent-check semantics per name
/// satisfies this contract. The store knows nothing about the change log or
/// the search index; orchestration lives in the coordinator.
pub trait SkillStore: Send + Sync {
    /// Commit one new version. Atomic per name: two concurrent commits to
    /// the same name serialize, and the one with a stale `expected_parent`
    /// fails with [`RegistryError::Conflict`].
    fn commit(&self, req: CommitRequest) -> Result<VersionRecord, RegistryError>;

    /// Get a specific version, or the latest when `version` is `None`.
    ///
    /// `latest` on a tombstoned skill is NotFound; pinned versions stay
    /// readable for audit.
    fn get(&self, name: &str, version: Option<u64>) -> Result<VersionRecord, RegistryError>;

    /// Full version history, oldest first, including tombstones.
    fn history(&self, name: &str) -> Result<Vec<VersionRecord>, RegistryError>;

    /// Append a tombstone version. NotFound if the name does not exist or is
    /// already tombstoned.
    fn delete(&self, name: &str, author_id: &str) -> Result<VersionRecord, RegistryError>;

    /// Every committed version in global commit order. This is the
    /// disaster-recovery contract: the change log and the search index are
    /// rebuilt from it on cold start.
    fn replay(&self) -> Result<Vec<ReplayEntry>, RegistryError>;

    /// Latest non-tombstone record of every live skill, for index rebuild.
    fn latest_records(&self) -> Result<Vec<VersionRecord>, RegistryError>;

    /// Number of live (non-deleted) skills.
    fn skill_count(&self) -> usize;
}
