//! Process-wide session registry.
//!
//! Every live session registers here for listing, broadcast, and shutdown.
//! Registration hands back a [`Registration`] guard; dropping it deregisters,
//! so a session that ends for any reason (panics included) leaves the map.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentwire_core::envelope::{Envelope, OutboundEvent};
use agentwire_core::error::SessionError;

use crate::state::SessionState;

/// A point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub turns: u64,
    pub turn_in_flight: bool,
}

struct Entry {
    snapshot: SessionSnapshot,
    outbound: mpsc::Sender<Envelope<OutboundEvent>>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Entry>>,
    count: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            count: watch::Sender::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a session. Fails if the id is already live.
    pub fn register(
        self: &Arc<Self>,
        session_id: &str,
        outbound: mpsc::Sender<Envelope<OutboundEvent>>,
    ) -> Result<Registration, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        let mut sessions = self.lock();
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyAttached(session_id.to_string()));
        }
        let now = Utc::now();
        sessions.insert(
            session_id.to_string(),
            Entry {
                snapshot: SessionSnapshot {
                    session_id: session_id.to_string(),
                    state: SessionState::Connecting,
                    connected_at: now,
                    last_activity_at: now,
                    turns: 0,
                    turn_in_flight: false,
                },
                outbound,
            },
        );
        self.count.send_replace(sessions.len());
        debug!(session_id, live = sessions.len(), "Session registered");
        Ok(Registration {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    fn deregister(&self, session_id: &str) {
        let mut sessions = self.lock();
        if sessions.remove(session_id).is_some() {
            self.count.send_replace(sessions.len());
            debug!(session_id, live = sessions.len(), "Session deregistered");
        }
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshots of every live session, oldest connection first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<_> = self.lock().values().map(|e| e.snapshot.clone()).collect();
        list.sort_by_key(|s| s.connected_at);
        list
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.lock().get(session_id).map(|e| e.snapshot.clone())
    }

    /// Queue an event to every live session. Sessions whose outbound queue is
    /// full are skipped. Returns how many received it.
    pub fn broadcast(&self, event: OutboundEvent) -> usize {
        let targets: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.outbound.clone()))
            .collect();
        let mut delivered = 0;
        for (session_id, outbound) in targets {
            match outbound.try_send(Envelope::new(event.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(session_id = %session_id, "Broadcast skipped: {e}"),
            }
        }
        delivered
    }

    /// The token every session watches for process shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signal every session to shut down and wait up to `wait` for all of
    /// them to deregister. Returns whether the registry drained in time.
    pub async fn shutdown(&self, wait: Duration) -> bool {
        let live = self.len();
        info!(sessions = live, "Shutting down sessions");
        self.shutdown.cancel();

        let mut count = self.count.subscribe();
        let drained = matches!(
            tokio::time::timeout(wait, count.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if !drained {
            warn!(remaining = self.len(), "Sessions still open after shutdown wait");
        }
        drained
    }
}

/// A session's place in the registry. Deregisters on drop.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Registration {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Update this session's snapshot.
    pub fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        if let Some(entry) = self.registry.lock().get_mut(&self.session_id) {
            f(&mut entry.snapshot);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.session_id);
    }
}
