//! Durable versioned skill storage.

mod models;
mod schema;
mod store;
mod trait_def;

pub use models::{CommitRequest, ReplayEntry, VersionRecord};
pub use store::SqliteSkillStore;
pub use trait_def::SkillStore;
