//! Wire protocol shared by the relay server, control consoles and endpoints.
//!
//! This crate provides the envelope type, the typed protocol unions, the
//! length-prefixed frame codec, and a client helper for talking to the relay
//! over TCP.
//!
//! # Architecture
//!
//! - [`envelope`]: The untyped JSON object carried by every frame
//! - [`protocol`]: Closed unions for registration, commands, reports and server messages
//! - [`transport`]: 4-byte big-endian length-prefixed codec
//! - [`client`]: Async client for either role
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use relay_proto::{ControlCommand, RelayClient};
//!
//! # async fn example() -> Result<(), relay_proto::ClientError> {
//! let mut client = RelayClient::connect_controller("127.0.0.1:5000").await?;
//! for host in client.list_hosts(Duration::from_secs(5)).await? {
//!     println!("{} ({})", host.custom_name, host.ip);
//! }
//! client
//!     .send_command(&ControlCommand::Screenshot, &["office-pc_12".to_string()])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod envelope;
pub mod protocol;
pub mod transport;

pub use client::{ClientError, DEFAULT_REPLY_TIMEOUT, RelayClient};
pub use envelope::Envelope;
pub use protocol::{
    AgentFrame, ControlCommand, ControlFrame, DEFAULT_PORT, FrameError, HEARTBEAT_INTERVAL,
    Hello, HostEntry, HostInfo, MouseButton, ResultKind, ServerMessage, VideoQuality,
};
pub use transport::{CodecError, DEFAULT_MAX_FRAME_SIZE, FrameCodec, decode_frame, encode_frame};
