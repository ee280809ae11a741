//! TCP accept loop and background tasks of the relay.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelaySettings;
use crate::config_watcher::{DisplayNames, watch_display_names};
use crate::connection::{RelayContext, handle_connection};
use crate::error::Result;
use crate::liveness::LivenessMonitor;
use crate::presence::Presence;
use crate::registry::SessionRegistry;

/// A bound relay, ready to serve.
pub struct RelayServer {
    listener: TcpListener,
    ctx: RelayContext,
    settings: RelaySettings,
    config_path: Option<PathBuf>,
}

impl RelayServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(settings: RelaySettings) -> Result<Self> {
        let listener = TcpListener::bind(settings.listen).await?;

        let mut ctx = RelayContext::new(SessionRegistry::new());
        ctx.classify_timeout = settings.classify_timeout;
        ctx.control_idle_timeout = settings.control_idle_timeout;
        ctx.max_frame_size = settings.max_frame_size;
        ctx.presence
            .set_display_names(settings.display_names.clone())
            .await;

        Ok(Self {
            listener,
            ctx,
            settings,
            config_path: None,
        })
    }

    /// Reload display names whenever the file at `path` changes.
    #[must_use]
    pub fn watch_config(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.ctx.presence
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Every connection runs under a child token of `shutdown`, so cancelling
    /// it also tears down all live sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has lost its local address. Accept
    /// errors are logged and skipped.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let RelayServer {
            listener,
            ctx,
            settings,
            config_path,
        } = self;

        let monitor = LivenessMonitor::new(
            ctx.registry.clone(),
            ctx.presence.clone(),
            settings.sweep_interval,
            settings.heartbeat_timeout,
        );
        tokio::spawn(monitor.run(shutdown.clone()));

        if let Some(path) = config_path {
            tokio::spawn(config_reload_task(
                path,
                settings.display_names.clone(),
                ctx.presence.clone(),
                shutdown.clone(),
            ));
        }

        info!("Relay listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping relay");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("[{}] Failed to set TCP_NODELAY: {}", peer, e);
                        }
                        let ctx = ctx.clone();
                        let cancel = shutdown.child_token();
                        tokio::spawn(async move {
                            match handle_connection(stream, peer, ctx, cancel).await {
                                Ok(()) => {}
                                Err(e) if e.is_connection_fatal() => {
                                    warn!("[{}] Connection terminated: {}", peer, e);
                                }
                                Err(e) => error!("[{}] Connection handler failed: {}", peer, e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }

        let counts = ctx.registry.counts().await;
        info!(
            "Relay stopped with {} endpoints and {} control sessions connected",
            counts.controlled, counts.controls
        );
        Ok(())
    }
}

async fn config_reload_task(
    path: PathBuf,
    current: DisplayNames,
    presence: Presence,
    shutdown: CancellationToken,
) {
    let (names_tx, mut names_rx) = mpsc::unbounded_channel();
    let _watcher = match watch_display_names(path, current, names_tx) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!("Display name hot reload disabled: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            names = names_rx.recv() => {
                let Some(names) = names else { break };
                info!("Display names reloaded ({} overrides)", names.len());
                presence.set_display_names(names).await;
                presence.broadcast().await;
            }
        }
    }

    debug!("Config reload task ended");
}

/// Run the relay until Ctrl-C.
///
/// # Errors
///
/// Returns an error if binding fails.
pub async fn run(settings: RelaySettings, config_path: Option<PathBuf>) -> Result<()> {
    let mut server = RelayServer::bind(settings).await?;
    if let Some(path) = config_path {
        server = server.watch_config(path);
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        signal_token.cancel();
    });

    server.serve(shutdown).await
}
