//! Session registry: which endpoints and consoles are connected right now.
//!
//! The registry is the only shared mutable state in the relay. Every
//! operation takes the lock once, does its map work, copies out whatever
//! handles the caller needs, and releases the lock before returning. No I/O
//! happens while the lock is held; enqueueing to a connection's outbound
//! channel never blocks, so roster fan-out is done under the lock to keep
//! every console's view in registry order.
//!
//! Controlled endpoints are keyed by their self-reported identity, and a
//! second registration under the same identity replaces the first
//! (last-registered-wins). Control sessions are always additive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_proto::{Envelope, HostInfo};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::{RelayError, Result};
use crate::session::{ConnectionHandle, ConnectionId, ControlSession, ControlledSession, SessionId};

/// Identity and metadata of one controlled endpoint, as seen by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub identity: String,
    pub info: HostInfo,
}

/// Outcome of a conditional removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The entry belonged to the given connection and is gone now.
    Removed,
    /// Nothing was registered under the identity.
    Absent,
    /// A newer connection owns the identity; it was left in place.
    Superseded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub controlled: usize,
    pub controls: usize,
}

#[derive(Debug, Default)]
struct Inner {
    controlled: HashMap<String, ControlledSession>,
    controls: HashMap<SessionId, ControlSession>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn roster(&self) -> Vec<HostRecord> {
        let mut sessions: Vec<&ControlledSession> = self.controlled.values().collect();
        sessions.sort_by_key(|session| session.seq);
        sessions
            .into_iter()
            .map(|session| HostRecord {
                identity: session.identity.clone(),
                info: session.info.clone(),
            })
            .collect()
    }

    fn controls_in_order(&self) -> Vec<&ControlSession> {
        let mut sessions: Vec<&ControlSession> = self.controls.values().collect();
        sessions.sort_by_key(|session| session.seq);
        sessions
    }
}

/// Cloneable handle to the shared session table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a controlled endpoint. The heartbeat clock starts now.
    ///
    /// Returns the handle of the connection that previously held `identity`,
    /// which the caller is expected to close.
    pub async fn register_controlled(
        &self,
        identity: &str,
        handle: ConnectionHandle,
        info: HostInfo,
    ) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let connection = handle.id();
        let session = ControlledSession {
            identity: identity.to_string(),
            handle,
            info,
            last_heartbeat: Instant::now(),
            seq,
        };
        let previous = inner.controlled.insert(identity.to_string(), session);
        debug!(
            "Registered controlled {} ({} online)",
            identity,
            inner.controlled.len()
        );
        previous
            .map(|old| old.handle)
            .filter(|old| old.id() != connection)
    }

    /// Add a control session. Never replaces an existing one.
    pub async fn register_control(&self, handle: ConnectionHandle) -> SessionId {
        let id = SessionId::for_peer(handle.peer(), handle.id());
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        inner.controls.insert(
            id.clone(),
            ControlSession {
                id: id.clone(),
                handle,
                last_active: Instant::now(),
                seq,
            },
        );
        debug!(
            "Registered control session {} ({} connected)",
            id,
            inner.controls.len()
        );
        id
    }

    /// Refresh an endpoint's heartbeat. Returns `false` if it is not registered.
    pub async fn touch_heartbeat(&self, identity: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.controlled.get_mut(identity) {
            session.last_heartbeat = Instant::now();
            trace!("Heartbeat from {}", identity);
            true
        } else {
            false
        }
    }

    pub async fn touch_control(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.controls.get_mut(id) {
            session.last_active = Instant::now();
            true
        } else {
            false
        }
    }

    /// Unconditional, idempotent delete.
    pub async fn remove_controlled(&self, identity: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.controlled.remove(identity).is_some();
        if removed {
            info!("Removed controlled {}", identity);
        }
        removed
    }

    /// Remove `identity` only while it still belongs to `connection`.
    ///
    /// Used by a connection's own teardown so that a superseded connection
    /// never removes the entry of the one that replaced it.
    pub async fn remove_controlled_if(&self, identity: &str, connection: ConnectionId) -> Removal {
        let mut inner = self.inner.lock().await;
        let owner = inner
            .controlled
            .get(identity)
            .map(|session| session.handle.id());
        match owner {
            None => Removal::Absent,
            Some(owner) if owner != connection => Removal::Superseded,
            Some(_) => {
                inner.controlled.remove(identity);
                info!(
                    "Removed controlled {} ({} online)",
                    identity,
                    inner.controlled.len()
                );
                Removal::Removed
            }
        }
    }

    /// Idempotent delete of a control session.
    pub async fn remove_control(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.controls.remove(id).is_some();
        if removed {
            debug!(
                "Removed control session {} ({} connected)",
                id,
                inner.controls.len()
            );
        }
        removed
    }

    /// # Errors
    ///
    /// Returns `RelayError::TargetNotFound` if no endpoint holds `identity`.
    pub async fn lookup_controlled(&self, identity: &str) -> Result<ConnectionHandle> {
        let inner = self.inner.lock().await;
        inner
            .controlled
            .get(identity)
            .map(|session| session.handle.clone())
            .ok_or_else(|| RelayError::TargetNotFound(identity.to_string()))
    }

    pub async fn lookup_control(&self, id: &SessionId) -> Option<ConnectionHandle> {
        let inner = self.inner.lock().await;
        inner.controls.get(id).map(|session| session.handle.clone())
    }

    /// Registered endpoints in registration order.
    pub async fn snapshot_controlled(&self) -> Vec<HostRecord> {
        self.inner.lock().await.roster()
    }

    /// Connected control sessions in registration order.
    pub async fn snapshot_control_connections(&self) -> Vec<(SessionId, ConnectionHandle)> {
        let inner = self.inner.lock().await;
        inner
            .controls_in_order()
            .into_iter()
            .map(|session| (session.id.clone(), session.handle.clone()))
            .collect()
    }

    /// Build an envelope from the current roster and enqueue it to every
    /// control session without releasing the lock.
    ///
    /// Concurrent callers are totally ordered, so the last roster a console
    /// receives always matches the registry. Sessions whose queue is gone are
    /// closed and removed. Returns the number of deliveries.
    pub async fn broadcast_roster(&self, build: impl FnOnce(Vec<HostRecord>) -> Envelope) -> usize {
        let mut inner = self.inner.lock().await;
        let envelope = build(inner.roster());

        let mut delivered = 0;
        let mut dead = Vec::new();
        for session in inner.controls_in_order() {
            if session.handle.send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                session.handle.close();
                dead.push(session.id.clone());
            }
        }
        for id in dead {
            inner.controls.remove(&id);
            info!("Dropped unreachable control session {}", id);
        }
        delivered
    }

    /// Build an envelope from the current roster and enqueue it to `control`
    /// without releasing the lock.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if `control` can no longer be reached.
    pub async fn send_roster(
        &self,
        control: &ConnectionHandle,
        build: impl FnOnce(Vec<HostRecord>) -> Envelope,
    ) -> Result<()> {
        let inner = self.inner.lock().await;
        control.send(build(inner.roster()))
    }

    /// Remove every endpoint whose last heartbeat is older than `timeout` at
    /// `now`, returning them in registration order.
    ///
    /// The check and the removal happen under one lock, so a heartbeat that
    /// lands before the sweep always keeps its endpoint.
    pub async fn evict_stale(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(String, ConnectionHandle)> {
        let mut inner = self.inner.lock().await;
        let mut stale: Vec<(u64, String)> = inner
            .controlled
            .values()
            .filter(|session| now.saturating_duration_since(session.last_heartbeat) > timeout)
            .map(|session| (session.seq, session.identity.clone()))
            .collect();
        stale.sort_unstable();

        let evicted: Vec<(String, ConnectionHandle)> = stale
            .into_iter()
            .filter_map(|(_, identity)| {
                inner
                    .controlled
                    .remove(&identity)
                    .map(|session| (identity, session.handle))
            })
            .collect();
        if !evicted.is_empty() {
            debug!(
                "Evicted {} stale endpoints ({} online)",
                evicted.len(),
                inner.controlled.len()
            );
        }
        evicted
    }

    pub async fn counts(&self) -> RegistryCounts {
        let inner = self.inner.lock().await;
        RegistryCounts {
            controlled: inner.controlled.len(),
            controls: inner.controls.len(),
        }
    }
}
