//! Session types for relay connections.

use std::net::SocketAddr;

use relay_proto::{Envelope, HostInfo};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Unique id of one accepted TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, enough to tell connections apart in logs.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a control session, derived from its peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn for_peer(peer: SocketAddr, connection: ConnectionId) -> Self {
        Self(format!("{peer}#{}", connection.short()))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Cloneable handle to a live connection.
///
/// Sending only enqueues onto the connection's writer task, so it never
/// blocks and is safe to call right after copying the handle out of the
/// registry. A failed send means the writer has already gone away.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(
        peer: SocketAddr,
        sender: mpsc::UnboundedSender<Envelope>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            sender,
            cancel,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue an envelope for delivery.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if the connection is closed or its
    /// writer has stopped.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Transport(format!("{} is closing", self.peer)));
        }
        self.sender
            .send(envelope)
            .map_err(|_| RelayError::Transport(format!("{} writer is gone", self.peer)))
    }

    /// Ask the connection's handler to tear down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }
}

/// A registered controlled endpoint.
#[derive(Debug, Clone)]
pub struct ControlledSession {
    pub identity: String,
    pub handle: ConnectionHandle,
    pub info: HostInfo,
    pub last_heartbeat: Instant,
    pub(crate) seq: u64,
}

/// A registered control session.
#[derive(Debug, Clone)]
pub struct ControlSession {
    pub id: SessionId,
    pub handle: ConnectionHandle,
    pub last_active: Instant,
    pub(crate) seq: u64,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = SocketAddr::from(([127, 0, 0, 1], 40_000));
        (ConnectionHandle::new(peer, tx, CancellationToken::new()), rx)
    }

    pub fn host_info(hostname: &str) -> HostInfo {
        HostInfo {
            hostname: hostname.to_string(),
            custom_name: None,
            ip: "10.0.0.1".to_string(),
            platform: "Linux-6.1".to_string(),
            system: Some("Linux".to_string()),
            processor: None,
        }
    }
}
