//! Command forwarding and result fan-out.
//!
//! Every delivery is attempted independently: a missing or dead target never
//! stops delivery to the others in the same operation.

use relay_proto::{Envelope, ServerMessage};
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::session::ConnectionHandle;

/// What happened to each target of one forwarded command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub delivered: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Router {
    registry: SessionRegistry,
}

impl Router {
    #[must_use]
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Deliver `envelope` to each named endpoint.
    ///
    /// For every target that is not registered, `origin` receives an error
    /// envelope naming it. A target whose delivery fails is closed, which
    /// hands its cleanup to the target's own connection handler.
    pub async fn forward_to_targets(
        &self,
        origin: &ConnectionHandle,
        targets: &[String],
        envelope: &Envelope,
    ) -> ForwardReport {
        let mut report = ForwardReport::default();

        for target in targets {
            let handle = match self.registry.lookup_controlled(target).await {
                Ok(handle) => handle,
                Err(e) => {
                    info!("{}", e);
                    if origin
                        .send(ServerMessage::target_offline(target).to_envelope())
                        .is_err()
                    {
                        debug!("Origin {} gone before error reply", origin.peer());
                    }
                    report.missing.push(target.clone());
                    continue;
                }
            };

            match handle.send(envelope.clone()) {
                Ok(()) => report.delivered.push(target.clone()),
                Err(e) => {
                    warn!("Delivery to {} failed: {}", target, e);
                    // Its handler removes the entry and announces the departure.
                    handle.close();
                    report.failed.push(target.clone());
                }
            }
        }

        report
    }

    /// Deliver `envelope` to every control session.
    ///
    /// Returns the number of successful deliveries. Sessions that fail are
    /// removed after the whole snapshot has been attempted.
    pub async fn broadcast_to_controls(&self, envelope: &Envelope) -> usize {
        let controls = self.registry.snapshot_control_connections().await;
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, handle) in &controls {
            if let Err(e) = handle.send(envelope.clone()) {
                debug!("Broadcast to {} failed: {}", id, e);
                dead.push((id, handle));
            } else {
                delivered += 1;
            }
        }

        for (id, handle) in dead {
            handle.close();
            if self.registry.remove_control(id).await {
                info!("Dropped unreachable control session {}", id);
            }
        }

        delivered
    }
}
