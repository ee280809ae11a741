//! Relay server routing commands and results between control consoles and
//! remote endpoints.
//!
//! Controlled endpoints and control sessions never connect to each other.
//! Both connect here, announce their role in the first frame, and from then
//! on the relay forwards commands to named endpoints, fans results out to
//! every console, evicts endpoints whose heartbeats stop, and keeps every
//! console's view of who is online up to date.

pub mod config;
pub(crate) mod config_watcher;
pub mod connection;
pub mod error;
pub mod liveness;
pub mod presence;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use config::{RelayConfig, RelaySettings, default_config_path};
pub use connection::{RelayContext, handle_connection};
pub use error::{RelayError, Result};
pub use liveness::LivenessMonitor;
pub use presence::Presence;
pub use registry::{HostRecord, Removal, SessionRegistry};
pub use router::{ForwardReport, Router};
pub use server::{RelayServer, run};
pub use session::{ConnectionHandle, ConnectionId, SessionId};
