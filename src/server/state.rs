use axum::extract::FromRef;

use crate::changelog::ChangeLog;
use crate::coordinator::SyncCoordinator;
use crate::hub::BroadcastHub;
use std::sync::Arc;
use std::time::Instant;

pub type GuardedCoordinator = Arc<SyncCoordinator>;
pub type GuardedHub = Arc<BroadcastHub>;
pub type GuardedChangeLog = Arc<ChangeLog>;

#[derive(Clone)]
pub struct ServerState {
    pub start_time: Instant,
    pub coordinator: GuardedCoordinator,
    pub hub: GuardedHub,
    pub changelog: GuardedChangeLog,
    pub hash: String,
}

impl FromRef<ServerState> for GuardedCoordinator {
    fn from_ref(input: &ServerState) -> Self {
        input.coordinator.clone()
    }
}

impl FromRef<ServerState> for GuardedHub {
    fn from_ref(input: &ServerState) -> Self {
        input.hub.clone()
    }
}

impl FromRef<ServerState> for GuardedChangeLog {
    fn from_ref(input: &ServerState) -> Self {
        input.changelog.clone()
    }
}
