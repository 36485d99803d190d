//! Error types surfaced at the library boundary.

use thiserror::Error;

/// Errors produced by the registry core.
///
/// `Conflict` and `NotFound` are caller errors and map to 409/404 at the HTTP
/// boundary. `LogHalted` means the ordering authority failed and new writes
/// are refused until the process restarts.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The declared parent version does not match the current latest.
    /// The caller must re-read and resubmit; never retried internally.
    #[error("conflict on '{name}': expected parent {expected:?}, latest is {latest:?}")]
    Conflict {
        name: String,
        expected: Option<u64>,
        latest: Option<u64>,
    },

    #[error("skill not found: {0}")]
    NotFound(String),

    /// Continuity of the change feed cannot be guaranteed for this
    /// subscriber; the agent must full-resync.
    #[error("delivery gap: {0}")]
    DeliveryGap(String),

    /// The change log lost ordering authority; writes are halted.
    #[error("change log halted; writes are refused")]
    LogHalted,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RegistryError {
    /// Stable machine-readable code for wire payloads.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Conflict { .. } => "conflict",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::DeliveryGap(_) => "delivery_gap",
            RegistryError::LogHalted => "log_halted",
            RegistryError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Internal(e.into())
    }
}
