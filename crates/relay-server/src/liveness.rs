//! Periodic eviction of controlled endpoints whose heartbeats have stopped.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::presence::Presence;
use crate::registry::SessionRegistry;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    registry: SessionRegistry,
    presence: Presence,
    sweep_interval: Duration,
    heartbeat_timeout: Duration,
}

impl LivenessMonitor {
    #[must_use]
    pub fn new(
        registry: SessionRegistry,
        presence: Presence,
        sweep_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            presence,
            sweep_interval,
            heartbeat_timeout,
        }
    }

    /// One sweep as of `now`. Returns the evicted identities.
    ///
    /// Evicted connections are closed and a single presence broadcast follows
    /// if anything was removed.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let stale = self
            .registry
            .evict_stale(now, self.heartbeat_timeout)
            .await;

        let mut evicted = Vec::with_capacity(stale.len());
        for (identity, handle) in stale {
            info!(
                "Evicting {}: no heartbeat for over {:?}",
                identity, self.heartbeat_timeout
            );
            // Its handler finds the entry gone and skips a second broadcast.
            handle.close();
            evicted.push(identity);
        }

        if !evicted.is_empty() {
            self.presence.broadcast().await;
        }
        evicted
    }

    /// Sweep on a fixed interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                tick = interval.tick() => {
                    let evicted = self.sweep(tick).await;
                    if !evicted.is_empty() {
                        debug!("Sweep evicted {:?}", evicted);
                    }
                }
            }
        }

        debug!("Liveness monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{handle, host_info};

    fn monitor(registry: &SessionRegistry) -> LivenessMonitor {
        let presence = Presence::new(registry.clone());
        LivenessMonitor::new(
            registry.clone(),
            presence,
            DEFAULT_SWEEP_INTERVAL,
            DEFAULT_HEARTBEAT_TIMEOUT,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_fresh_sessions() {
        let registry = SessionRegistry::new();
        let (a, _rx) = handle();
        registry.register_controlled("A", a, host_info("a")).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(monitor(&registry).sweep(Instant::now()).await.is_empty());
        assert!(registry.lookup_controlled("A").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_sessions_and_broadcasts() {
        let registry = SessionRegistry::new();
        let (a, _a_rx) = handle();
        let (b, _b_rx) = handle();
        let (control, mut control_rx) = handle();
        registry.register_controlled("A", a.clone(), host_info("a")).await;
        registry.register_controlled("B", b, host_info("b")).await;
        registry.register_control(control).await;

        tokio::time::advance(Duration::from_secs(40)).await;
        registry.touch_heartbeat("B").await;
        tokio::time::advance(Duration::from_secs(21)).await;

        let evicted = monitor(&registry).sweep(Instant::now()).await;
        assert_eq!(evicted, vec!["A"]);
        assert!(a.is_closed());

        let update = control_rx.recv().await.unwrap();
        let hosts = update.get("hosts").unwrap().as_array().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0]["id"], "B");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_without_evictions_stays_quiet() {
        let registry = SessionRegistry::new();
        let (control, mut control_rx) = handle();
        registry.register_control(control).await;

        assert!(monitor(&registry).sweep(Instant::now()).await.is_empty());
        assert!(control_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_evicts_within_one_sweep_cycle() {
        let registry = SessionRegistry::new();
        let (a, _rx) = handle();
        registry.register_controlled("A", a, host_info("a")).await;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor(&registry).run(shutdown.clone()));

        // Timeout elapses at 60s; the sweep at 90s must catch it.
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert!(registry.lookup_controlled("A").await.is_err());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_before_sweep_prevents_eviction() {
        let registry = SessionRegistry::new();
        let (a, _rx) = handle();
        let (control, mut control_rx) = handle();
        registry.register_controlled("A", a.clone(), host_info("a")).await;
        registry.register_control(control).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let tick = Instant::now();
        registry.touch_heartbeat("A").await;

        assert!(monitor(&registry).sweep(tick).await.is_empty());
        assert!(!a.is_closed());
        assert!(registry.lookup_controlled("A").await.is_ok());
        assert!(control_rx.try_recv().is_err());
    }
}
