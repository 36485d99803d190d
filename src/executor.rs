//! Skill execution capability.

use crate::skill_store::VersionRecord;
use async_trait::async_trait;
use serde_json::Value;

/// Runs a skill in some sandbox.
///
/// The registry never executes anything itself; it only hands an immutable
/// [`VersionRecord`] to whatever implements this trait. Implementations live
/// outside this crate.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, record: &VersionRecord, args: Value) -> anyhow::Result<Value>;
}
