//! Presence broadcaster: pushes the endpoint roster to control sessions.
//!
//! Lock order is display names, then registry. Holding the names guard across
//! the registry fan-out keeps a rename and its broadcast ordered after any
//! broadcast already in flight.

use std::collections::HashMap;
use std::sync::Arc;

use relay_proto::{Envelope, HostEntry, ServerMessage};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::registry::{HostRecord, SessionRegistry};
use crate::session::ConnectionHandle;

#[derive(Debug, Clone)]
pub struct Presence {
    registry: SessionRegistry,
    display_names: Arc<RwLock<HashMap<String, String>>>,
}

impl Presence {
    #[must_use]
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            display_names: Arc::default(),
        }
    }

    /// Replace the operator-assigned display names.
    pub async fn set_display_names(&self, names: HashMap<String, String>) {
        *self.display_names.write().await = names;
    }

    /// Current roster, in registration order.
    pub async fn roster(&self) -> Vec<HostEntry> {
        let names = self.display_names.read().await;
        let records = self.registry.snapshot_controlled().await;
        roster(records, &names)
    }

    /// Send the roster to one control session.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if the session can no longer be reached.
    pub async fn send_to(&self, control: &ConnectionHandle) -> Result<()> {
        let names = self.display_names.read().await;
        self.registry
            .send_roster(control, |records| host_list(records, &names))
            .await
    }

    /// Send the roster to every control session. Returns the delivery count.
    pub async fn broadcast(&self) -> usize {
        let names = self.display_names.read().await;
        let delivered = self
            .registry
            .broadcast_roster(|records| host_list(records, &names))
            .await;
        debug!("Presence broadcast reached {} control sessions", delivered);
        delivered
    }
}

fn roster(records: Vec<HostRecord>, names: &HashMap<String, String>) -> Vec<HostEntry> {
    records
        .into_iter()
        .map(|record| host_entry(record, names))
        .collect()
}

fn host_list(records: Vec<HostRecord>, names: &HashMap<String, String>) -> Envelope {
    ServerMessage::HostList {
        hosts: roster(records, names),
    }
    .to_envelope()
}

fn host_entry(record: HostRecord, names: &HashMap<String, String>) -> HostEntry {
    let custom_name = names
        .get(&record.identity)
        .filter(|name| !name.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| record.info.reported_name().to_string());
    HostEntry {
        id: record.identity,
        hostname: record.info.hostname,
        ip: record.info.ip,
        platform: record.info.platform,
        custom_name,
    }
}
