//! Fan-out of change records to subscribed agents.
//!
//! Delivery is pull-based: each session gets a forwarder task that walks the
//! change log from its own cursor and wakes on the log's tail watch. That
//! gives every session a strictly increasing, gapless view regardless of how
//! commits interleave across names.

use crate::changelog::{ChangeLog, ChangeRecord};
use crate::error::RegistryError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const REPLAY_BATCH_SIZE: usize = 128;
const SESSION_CHANNEL_SIZE: usize = 32;

/// What a subscriber receives on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Change(ChangeRecord),
    /// Replay of the backlog is done; everything after this is live.
    CatchUpComplete { through: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// A connected session with no heartbeat for this long is treated as
    /// disconnected.
    pub heartbeat_timeout: Duration,
    /// How long a disconnected session's state is kept for resumption.
    pub retention: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            heartbeat_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(300),
        }
    }
}

struct SessionState {
    last_acked: u64,
    last_heartbeat: Instant,
    disconnected_at: Option<Instant>,
    /// Flipping this to true tells the session's forwarder task to exit.
    close_tx: watch::Sender<bool>,
}

/// Tracks agent sessions and feeds each one the change log.
pub struct BroadcastHub {
    changelog: Arc<ChangeLog>,
    config: HubConfig,
    sessions: RwLock<HashMap<String, SessionState>>,
    /// Session ids whose state aged out; resuming one of these requires a
    /// full resync on the client side.
    purged: RwLock<HashSet<String>>,
}

impl BroadcastHub {
    pub fn new(changelog: Arc<ChangeLog>, config: HubConfig) -> Self {
        BroadcastHub {
            changelog,
            config,
            sessions: RwLock::new(HashMap::new()),
            purged: RwLock::new(HashSet::new()),
        }
    }

    /// Subscribe a session starting after `from_sequence`.
    ///
    /// The returned receiver first yields every logged change with sequence
    /// greater than `from_sequence`, then a [`HubEvent::CatchUpComplete`]
    /// marker, then live changes as they land. Dropping the receiver ends
    /// the forwarder task.
    pub fn subscribe(
        &self,
        session_id: &str,
        from_sequence: u64,
    ) -> Result<mpsc::Receiver<HubEvent>, RegistryError> {
        if self.purged.write().unwrap().remove(session_id) {
            return Err(RegistryError::DeliveryGap(format!(
                "session {} expired; full resync required",
                session_id
            )));
        }
        if from_sequence > self.changelog.tail() {
            return Err(RegistryError::DeliveryGap(format!(
                "sequence {} is ahead of the log tail {}",
                from_sequence,
                self.changelog.tail()
            )));
        }

        let (close_tx, close_rx) = watch::channel(false);
        {
            let mut sessions = self.sessions.write().unwrap();
            if let Some(previous) = sessions.insert(
                session_id.to_string(),
                SessionState {
                    last_acked: from_sequence,
                    last_heartbeat: Instant::now(),
                    disconnected_at: None,
                    close_tx,
                },
            ) {
                debug!("Replacing forwarder for session {}", session_id);
                let _ = previous.close_tx.send(true);
            }
        }

        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_SIZE);
        let changelog = self.changelog.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            forward_changes(changelog, session_id, from_sequence, tx, close_rx).await;
        });
        Ok(rx)
    }

    /// Record that the agent has processed everything up to `sequence`.
    pub fn ack(&self, session_id: &str, sequence: u64) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(session_id) {
            if sequence > session.last_acked {
                session.last_acked = sequence;
            }
        }
    }

    pub fn heartbeat(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(session_id) {
            session.last_heartbeat = Instant::now();
        }
    }

    /// Mark a session disconnected, keeping its cursor for resumption.
    pub fn disconnect(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(session_id) {
            if session.disconnected_at.is_none() {
                session.disconnected_at = Some(Instant::now());
            }
            let _ = session.close_tx.send(true);
        }
    }

    /// Formally end a session, forgetting its cursor immediately.
    pub fn unsubscribe(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().unwrap().remove(session_id) {
            let _ = session.close_tx.send(true);
            info!("Session {} unsubscribed", session_id);
        }
    }

    pub fn last_acked(&self, session_id: &str) -> Option<u64> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)
            .map(|s| s.last_acked)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.disconnected_at.is_none())
            .count()
    }

    /// One sweep of session maintenance: time out silent sessions, purge
    /// disconnected ones past the retention window. Called periodically.
    pub fn reap(&self) {
        let now = Instant::now();
        let mut to_purge = Vec::new();
        {
            let mut sessions = self.sessions.write().unwrap();
            for (id, session) in sessions.iter_mut() {
                match session.disconnected_at {
                    None => {
                        if now.duration_since(session.last_heartbeat) > self.config.heartbeat_timeout
                        {
                            warn!("Session {} missed heartbeats, disconnecting", id);
                            session.disconnected_at = Some(now);
                            let _ = session.close_tx.send(true);
                        }
                    }
                    Some(at) => {
                        if now.duration_since(at) > self.config.retention {
                            to_purge.push(id.clone());
                        }
                    }
                }
            }
            for id in &to_purge {
                sessions.remove(id);
            }
        }
        if !to_purge.is_empty() {
            info!("Purged {} expired sessions", to_purge.len());
            let mut purged = self.purged.write().unwrap();
            for id in to_purge {
                purged.insert(id);
            }
        }
    }
}

/// Per-session forwarder: replay from the cursor, mark the catch-up
/// boundary, then follow the live tail.
async fn forward_changes(
    changelog: Arc<ChangeLog>,
    session_id: String,
    from_sequence: u64,
    tx: mpsc::Sender<HubEvent>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut cursor = from_sequence;
    let catch_up_target = changelog.tail();

    // Replay phase.
    while cursor < catch_up_target {
        let batch = changelog.read_from(cursor, REPLAY_BATCH_SIZE);
        if batch.is_empty() {
            break;
        }
        for record in batch {
            cursor = record.sequence;
            if tx.send(HubEvent::Change(record)).await.is_err() {
                return;
            }
        }
    }
    if tx
        .send(HubEvent::CatchUpComplete { through: cursor })
        .await
        .is_err()
    {
        return;
    }

    // Live phase.
    let mut tail_rx = changelog.watch_tail();
    loop {
        while *tail_rx.borrow_and_update() > cursor {
            for record in changelog.read_from(cursor, REPLAY_BATCH_SIZE) {
                cursor = record.sequence;
                if tx.send(HubEvent::Change(record)).await.is_err() {
                    return;
                }
            }
        }
        tokio::select! {
            changed = tail_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    debug!("Forwarder for session {} closed", session_id);
                    return;
                }
            }
        }
    }
}
