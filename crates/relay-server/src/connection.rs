//! Per-connection handler.
//!
//! Each accepted connection runs through
//! `AwaitingClassification -> ControlledActive | ControlActive -> Closed`.
//! The first frame decides the role. Frames on one connection are processed
//! strictly in arrival order; outbound envelopes are queued to a dedicated
//! writer task so that forwarding never blocks on a slow peer.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use relay_proto::{
    AgentFrame, ControlFrame, Envelope, FrameCodec, Hello, HostInfo, ServerMessage,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{RelayError, Result};
use crate::presence::Presence;
use crate::registry::{Removal, SessionRegistry};
use crate::router::Router;
use crate::session::{ConnectionHandle, SessionId};

pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONTROL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared services every connection handler works against.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub registry: SessionRegistry,
    pub router: Router,
    pub presence: Presence,
    pub classify_timeout: Duration,
    pub control_idle_timeout: Duration,
    pub max_frame_size: usize,
}

impl RelayContext {
    #[must_use]
    pub fn new(registry: SessionRegistry) -> Self {
        let router = Router::new(registry.clone());
        let presence = Presence::new(registry.clone());
        Self {
            registry,
            router,
            presence,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            control_idle_timeout: DEFAULT_CONTROL_IDLE_TIMEOUT,
            max_frame_size: relay_proto::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

type FrameStream<T> = SplitStream<Framed<T, FrameCodec>>;

/// Serve one connection until it closes, fails, or `cancel` fires.
///
/// The connection's registry entry is removed on every exit path.
///
/// # Errors
///
/// Returns the error that ended the connection: a malformed frame, a
/// rejected registration, or a transport failure.
pub async fn handle_connection<T>(
    io: T,
    peer: SocketAddr,
    ctx: RelayContext,
    cancel: CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let framed = Framed::new(io, FrameCodec::with_max_frame_size(ctx.max_frame_size));
    let (mut sink, mut frames) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let handle = ConnectionHandle::new(peer, tx, cancel.clone());
    debug!("[{}] New connection {}", peer, handle.id().short());

    let writer_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        trace!("[{}] send_task started", peer);
        loop {
            tokio::select! {
                biased;
                () = writer_cancel.cancelled() => break,
                next = rx.recv() => {
                    let Some(envelope) = next else { break };
                    if let Err(e) = sink.send(envelope).await {
                        warn!("[{}] Failed to send: {}", peer, e);
                        writer_cancel.cancel();
                        break;
                    }
                }
            }
        }
        trace!("[{}] send_task ended", peer);
    });

    let connection = Connection {
        peer,
        handle,
        ctx,
        cancel: cancel.clone(),
    };
    let result = connection.run(&mut frames).await;

    cancel.cancel();
    send_task.abort();
    debug!("[{}] Connection closed", peer);

    result
}

struct Connection {
    peer: SocketAddr,
    handle: ConnectionHandle,
    ctx: RelayContext,
    cancel: CancellationToken,
}

impl Connection {
    async fn run<T>(&self, frames: &mut FrameStream<T>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite,
    {
        let first = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            first = tokio::time::timeout(self.ctx.classify_timeout, frames.next()) => first,
        };

        let envelope = match first {
            Err(_) => {
                return Err(RelayError::Registration(format!(
                    "no registration frame within {:?}",
                    self.ctx.classify_timeout
                )));
            }
            Ok(None) => {
                debug!("[{}] Closed before registering", self.peer);
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(envelope))) => envelope,
        };

        let hello =
            Hello::from_envelope(&envelope).map_err(|e| RelayError::Registration(e.to_string()))?;

        match hello {
            Hello::Agent { agent_id, info } => self.run_controlled(frames, agent_id, info).await,
            Hello::Controller => self.run_control(frames).await,
        }
    }

    async fn run_controlled<T>(
        &self,
        frames: &mut FrameStream<T>,
        identity: String,
        info: HostInfo,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite,
    {
        info!(
            "[{}] Controlled endpoint {} connected ({}, {}, {})",
            self.peer, identity, info.hostname, info.ip, info.platform
        );

        if let Some(previous) = self
            .ctx
            .registry
            .register_controlled(&identity, self.handle.clone(), info)
            .await
        {
            info!(
                "{} re-registered from {}; closing previous connection from {}",
                identity,
                self.peer,
                previous.peer()
            );
            previous.close();
        }
        self.ctx.presence.broadcast().await;

        let result = loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Ok(()),
                frame = frames.next() => frame,
            };
            match frame {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(envelope)) => self.handle_agent_frame(&identity, envelope).await,
            }
        };

        match self
            .ctx
            .registry
            .remove_controlled_if(&identity, self.handle.id())
            .await
        {
            Removal::Removed => {
                info!("Controlled endpoint {} disconnected", identity);
                self.ctx.presence.broadcast().await;
            }
            Removal::Absent => debug!("{} was already evicted", identity),
            Removal::Superseded => debug!("{} superseded by a newer connection", identity),
        }

        result
    }

    async fn handle_agent_frame(&self, identity: &str, envelope: Envelope) {
        let mut envelope = match AgentFrame::from_envelope(envelope) {
            AgentFrame::Heartbeat => {
                self.ctx.registry.touch_heartbeat(identity).await;
                return;
            }
            AgentFrame::Report { kind, envelope } => {
                trace!("{:?} report from {}", kind, identity);
                envelope
            }
            AgentFrame::Unrecognized(envelope) => {
                debug!(
                    "Relaying unrecognized {:?} frame from {} as-is",
                    envelope.kind(),
                    identity
                );
                envelope
            }
        };
        envelope.tag_agent(identity);
        let delivered = self.ctx.router.broadcast_to_controls(&envelope).await;
        trace!("Relayed frame from {} to {} control sessions", identity, delivered);
    }

    async fn run_control<T>(&self, frames: &mut FrameStream<T>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite,
    {
        let session_id = self.ctx.registry.register_control(self.handle.clone()).await;
        info!("[{}] Control session {} connected", self.peer, session_id);

        let result = match self.ctx.presence.send_to(&self.handle).await {
            Ok(()) => self.control_loop(frames, &session_id).await,
            Err(e) => Err(e),
        };

        self.ctx.registry.remove_control(&session_id).await;
        info!("Control session {} disconnected", session_id);

        result
    }

    /// Idle and dead are separate conditions: the first idle timeout sends a
    /// ping, only a second one with the ping unanswered (or a failed ping
    /// send) closes the session.
    async fn control_loop<T>(&self, frames: &mut FrameStream<T>, session_id: &SessionId) -> Result<()>
    where
        T: AsyncRead + AsyncWrite,
    {
        let mut ping_outstanding = false;

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout(self.ctx.control_idle_timeout, frames.next()) => next,
            };

            let envelope = match next {
                Err(_) if ping_outstanding => {
                    info!("Control session {} did not answer ping, closing", session_id);
                    return Ok(());
                }
                Err(_) => {
                    debug!("Control session {} idle, sending ping", session_id);
                    self.handle.send(ServerMessage::Ping.to_envelope())?;
                    ping_outstanding = true;
                    continue;
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(envelope))) => envelope,
            };

            ping_outstanding = false;
            self.ctx.registry.touch_control(session_id).await;
            self.handle_control_frame(session_id, &envelope).await?;
        }
    }

    async fn handle_control_frame(&self, session_id: &SessionId, envelope: &Envelope) -> Result<()> {
        match ControlFrame::from_envelope(envelope) {
            Ok(ControlFrame::Pong) => {
                trace!("Pong from {}", session_id);
                Ok(())
            }
            Ok(ControlFrame::Command { command, .. }) if command.is_presence_request() => {
                debug!("{} requested {}", session_id, command.name());
                self.ctx.presence.send_to(&self.handle).await
            }
            Ok(ControlFrame::Command { command, targets }) => {
                if targets.is_empty() {
                    debug!("{} from {} names no targets", command.name(), session_id);
                }
                let report = self
                    .ctx
                    .router
                    .forward_to_targets(&self.handle, &targets, envelope)
                    .await;
                debug!(
                    "{} from {}: delivered {:?}, missing {:?}, failed {:?}",
                    command.name(),
                    session_id,
                    report.delivered,
                    report.missing,
                    report.failed
                );
                Ok(())
            }
            Err(e) => {
                warn!("Rejected frame from {}: {}", session_id, e);
                self.handle.send(
                    ServerMessage::Error {
                        message: format!("invalid command: {e}"),
                    }
                    .to_envelope(),
                )
            }
        }
    }
}
