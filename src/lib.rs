//! Skills Registry Server Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod changelog;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod hub;
pub mod search_index;
pub mod server;
pub mod skill_store;

// Re-export commonly used types for convenience
pub use changelog::{ChangeKind, ChangeLog, ChangeRecord};
pub use coordinator::{RepairQueue, SyncCoordinator};
pub use error::RegistryError;
pub use hub::{BroadcastHub, HubConfig};
pub use search_index::{Embedder, HashEmbedder, InMemorySearchIndex, SearchIndex};
pub use server::{run_server, ServerState};
pub use skill_store::{SkillStore, SqliteSkillStore};
