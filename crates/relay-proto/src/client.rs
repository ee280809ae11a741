//! Async client for connecting to the relay as either role.
//!
//! Wraps a framed TCP connection: outbound envelopes go through a shared sink,
//! inbound envelopes are pumped into a channel by a background reader task.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::protocol::{
    ControlCommand, HEARTBEAT_ACTION, HostEntry, HostInfo, Hello, PONG_TYPE, ServerMessage,
};
use crate::transport::{CodecError, FrameCodec};

/// Default time to wait for an expected reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur with the relay client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for reply")]
    Timeout,

    #[error("Relay reported an error: {0}")]
    Relay(String),
}

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Envelope>;

/// Client connection to the relay
pub struct RelayClient {
    sender: Arc<Mutex<FrameSink>>,
    incoming_rx: mpsc::UnboundedReceiver<Envelope>,
    reader: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to a relay server without sending a registration frame.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Io` if the TCP connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let framed = Framed::new(stream, FrameCodec::new());
        let (sink, mut stream) = framed.split();

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(envelope) => {
                        trace!("client received {:?}", envelope.kind());
                        if incoming_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("client read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sender: Arc::new(Mutex::new(sink)),
            incoming_rx,
            reader,
        })
    }

    /// Connect and register as a control session.
    ///
    /// The relay acknowledges a registration with the current roster; that
    /// first `host_list` is consumed here, so later replies belong to later
    /// requests.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or sending the registration fails, or
    /// if the relay does not acknowledge within [`DEFAULT_REPLY_TIMEOUT`].
    pub async fn connect_controller(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let mut client = Self::connect(addr).await?;
        client
            .send(ControlCommand::Register.to_envelope(&[])?)
            .await?;
        client.wait_for("host_list", DEFAULT_REPLY_TIMEOUT).await?;
        Ok(client)
    }

    /// Connect and register as a controlled endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or sending the registration fails.
    pub async fn connect_agent(
        addr: impl ToSocketAddrs,
        agent_id: impl Into<String>,
        info: HostInfo,
    ) -> Result<Self, ClientError> {
        let client = Self::connect(addr).await?;
        let hello = Hello::Agent {
            agent_id: agent_id.into(),
            info,
        };
        client.send(Envelope::from_serializable(&hello)?).await?;
        Ok(client)
    }

    /// Send a raw envelope.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Codec` if the frame cannot be written.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let mut sender = self.sender.lock().await;
        sender.send(envelope).await?;
        Ok(())
    }

    /// Send a control command addressed to `targets`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or sending fails.
    pub async fn send_command(
        &self,
        command: &ControlCommand,
        targets: &[String],
    ) -> Result<(), ClientError> {
        self.send(command.to_envelope(targets)?).await
    }

    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.send(Envelope::new().with_field("action", HEARTBEAT_ACTION))
            .await
    }

    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn pong(&self) -> Result<(), ClientError> {
        self.send(Envelope::new().with_field("type", PONG_TYPE)).await
    }

    /// Close the write half; the relay sees end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the final frames fails.
    pub async fn close(&self) -> Result<(), ClientError> {
        let mut sender = self.sender.lock().await;
        sender.close().await?;
        Ok(())
    }

    /// Next inbound envelope, or `None` once the relay has closed the connection.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.incoming_rx.recv().await
    }

    /// # Errors
    ///
    /// Returns `ClientError::Timeout` or `ClientError::ConnectionClosed`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Envelope, ClientError> {
        tokio::time::timeout(timeout, self.incoming_rx.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
            .ok_or(ClientError::ConnectionClosed)
    }

    /// Wait for the first envelope whose `type` is `kind`, discarding others.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Timeout` if nothing matching arrives in time.
    pub async fn wait_for(&mut self, kind: &str, timeout: Duration) -> Result<Envelope, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let envelope = self.recv_timeout(remaining).await?;
            if envelope.kind() == Some(kind) {
                return Ok(envelope);
            }
            trace!("wait_for({}) skipping {:?}", kind, envelope.kind());
        }
    }

    /// Request the current roster and wait for the reply.
    ///
    /// Relayed endpoint results arriving meanwhile are skipped and pings are
    /// answered.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Relay` if the relay answers with an error, or an
    /// error if the request cannot be sent or no roster arrives in time.
    pub async fn list_hosts(&mut self, timeout: Duration) -> Result<Vec<HostEntry>, ClientError> {
        self.send_command(&ControlCommand::ListHosts, &[]).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let envelope = self.recv_timeout(remaining).await?;
            if envelope.agent_id().is_some() {
                trace!("list_hosts skipping relayed {:?}", envelope.kind());
                continue;
            }
            match envelope.parse::<ServerMessage>() {
                Ok(ServerMessage::HostList { hosts }) => return Ok(hosts),
                Ok(ServerMessage::Error { message }) => return Err(ClientError::Relay(message)),
                Ok(ServerMessage::Ping) => self.pong().await?,
                Err(e) => debug!("list_hosts ignoring {:?}: {}", envelope.kind(), e),
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // The reader owns the read half; stop it so the socket actually closes.
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(ClientError::Timeout.to_string(), "Timed out waiting for reply");
        assert!(
            ClientError::Relay("target C is not online".to_string())
                .to_string()
                .contains("target C")
        );
    }

    #[test]
    fn test_client_error_from_codec() {
        let codec_err = CodecError::FrameTooLarge {
            size: 100_000_000,
            max: 10,
        };
        let client_err: ClientError = codec_err.into();
        assert!(matches!(client_err, ClientError::Codec(_)));
        assert!(client_err.to_string().contains("100000000"));
    }

    fn host(id: &str) -> HostEntry {
        HostEntry {
            id: id.to_string(),
            hostname: format!("{id}-host"),
            ip: "10.0.0.5".to_string(),
            platform: "Windows-10".to_string(),
            custom_name: format!("{id}-host"),
        }
    }

    #[tokio::test]
    async fn test_list_hosts_returns_reply_not_registration_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let register = framed.next().await.unwrap().unwrap();
            framed
                .send(ServerMessage::HostList { hosts: vec![] }.to_envelope())
                .await
                .unwrap();

            let request = framed.next().await.unwrap().unwrap();
            framed.send(ServerMessage::Ping.to_envelope()).await.unwrap();
            framed
                .send(
                    Envelope::new()
                        .with_field("type", "error")
                        .with_field("message", "access denied")
                        .with_field("agent_id", "B"),
                )
                .await
                .unwrap();
            framed
                .send(
                    ServerMessage::HostList {
                        hosts: vec![host("A")],
                    }
                    .to_envelope(),
                )
                .await
                .unwrap();
            let pong = framed.next().await.unwrap().unwrap();
            (register, request, pong)
        });

        let mut client = RelayClient::connect_controller(addr).await.unwrap();
        let hosts = client.list_hosts(Duration::from_secs(5)).await.unwrap();
        assert_eq!(hosts, vec![host("A")]);

        let (register, request, pong) = server.await.unwrap();
        assert_eq!(register.kind(), Some("controller"));
        assert_eq!(register.action(), Some("register"));
        assert_eq!(request.action(), Some("list_hosts"));
        assert_eq!(pong.kind(), Some("pong"));
    }

    #[tokio::test]
    async fn test_list_hosts_surfaces_relay_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            framed.next().await.unwrap().unwrap();
            framed
                .send(ServerMessage::HostList { hosts: vec![] }.to_envelope())
                .await
                .unwrap();
            framed.next().await.unwrap().unwrap();
            framed
                .send(
                    ServerMessage::Error {
                        message: "invalid command: busy".to_string(),
                    }
                    .to_envelope(),
                )
                .await
                .unwrap();
            framed
        });

        let mut client = RelayClient::connect_controller(addr).await.unwrap();
        let result = client.list_hosts(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ClientError::Relay(msg)) if msg.contains("busy")));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_recv_reports_closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut client = RelayClient::connect(addr).await.unwrap();
        server.await.unwrap();

        let result = client.recv_timeout(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }
}
