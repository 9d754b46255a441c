use std::sync::Arc;
use std::time::Duration;

use chaos_core::config::DiscoveryConfig;
use chaos_core::{ChaosError, Lease, LeaseState, Result, ServiceDescriptor, TerminationReason};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::hooks::LifecycleMetrics;
use crate::registry::RegistryClient;
use crate::shutdown::ShutdownTrigger;

/// Heartbeat settings that do not vary per lease.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Upper bound on each registry call, including deregistration.
    pub call_timeout: Duration,
    /// Consecutive refresh failures before shutdown is triggered.
    /// `None` keeps retrying for as long as the process lives.
    pub max_refresh_failures: Option<u32>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            max_refresh_failures: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn from_discovery(config: &DiscoveryConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            max_refresh_failures: config.max_refresh_failures,
        }
    }
}

struct ActiveLease {
    descriptor: ServiceDescriptor,
    ttl: Duration,
    refresh_interval: Duration,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Keeps one registry lease alive.
///
/// [`start`](Self::start) registers synchronously and spawns a refresh loop;
/// [`stop`](Self::stop) ends the loop and deregisters. The lease and its state
/// are owned here and only observable through snapshots.
pub struct Heartbeat {
    registry: Arc<dyn RegistryClient>,
    config: HeartbeatConfig,
    state: Arc<watch::Sender<LeaseState>>,
    lease: Option<ActiveLease>,
    metrics: Option<Arc<LifecycleMetrics>>,
    escalation: Option<ShutdownTrigger>,
}

impl Heartbeat {
    /// Create a heartbeat over `registry`.
    pub fn new(registry: Arc<dyn RegistryClient>, config: HeartbeatConfig) -> Self {
        let (state, _) = watch::channel(LeaseState::Unregistered);
        Self {
            registry,
            config,
            state: Arc::new(state),
            lease: None,
            metrics: None,
            escalation: None,
        }
    }

    /// Count registrations and refreshes in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<LifecycleMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Trigger to fire when the refresh failure limit is reached.
    pub fn with_escalation(mut self, trigger: ShutdownTrigger) -> Self {
        self.set_escalation(trigger);
        self
    }

    pub(crate) fn set_escalation(&mut self, trigger: ShutdownTrigger) {
        self.escalation = Some(trigger);
    }

    /// Current lease state.
    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    /// Receiver that observes lease state changes.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Snapshot of the current lease, if one was started and not stopped.
    pub fn lease(&self) -> Option<Lease> {
        self.lease.as_ref().map(|l| Lease {
            descriptor: l.descriptor.clone(),
            ttl: l.ttl,
            refresh_interval: l.refresh_interval,
            state: self.state(),
        })
    }

    /// Whether the refresh loop is still running.
    pub fn is_refreshing(&self) -> bool {
        self.lease
            .as_ref()
            .and_then(|l| l.task.as_ref())
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Register `descriptor` and, when `refresh_interval` is non-zero, keep it alive.
    ///
    /// On failure the lease stays `Unregistered` and the error is returned;
    /// the caller decides whether that is fatal.
    pub async fn start(
        &mut self,
        descriptor: ServiceDescriptor,
        ttl: Duration,
        refresh_interval: Duration,
    ) -> Result<()> {
        if self.state().is_active() || self.lease.is_some() {
            return Err(ChaosError::InvalidState(format!(
                "lease for {} is still {}; stop it before starting another",
                descriptor,
                self.state()
            )));
        }

        let registered = call_with_timeout(
            "register",
            self.config.call_timeout,
            self.registry.register(&descriptor, ttl),
        )
        .await;

        if let Err(e) = registered {
            self.state.send_replace(LeaseState::Unregistered);
            return Err(e);
        }

        self.state.send_replace(LeaseState::Registered);
        if let Some(metrics) = &self.metrics {
            metrics.record_registration();
        }
        tracing::info!(
            service = %descriptor.name,
            node_id = %descriptor.node_id,
            address = %descriptor.advertised_address,
            backend = self.registry.backend(),
            ttl_secs = ttl.as_secs(),
            "Registered service"
        );

        let stop = CancellationToken::new();
        let task = if refresh_interval.is_zero() {
            tracing::debug!("Refresh interval is zero, registration will not be refreshed");
            None
        } else {
            let refresh = RefreshLoop {
                registry: self.registry.clone(),
                descriptor: descriptor.clone(),
                ttl,
                interval: refresh_interval,
                call_timeout: self.config.call_timeout,
                max_failures: self.config.max_refresh_failures,
                state: self.state.clone(),
                metrics: self.metrics.clone(),
                escalation: self.escalation.clone(),
                stop: stop.clone(),
            };
            Some(tokio::spawn(refresh.run()))
        };

        self.lease = Some(ActiveLease {
            descriptor,
            ttl,
            refresh_interval,
            stop,
            task,
        });
        Ok(())
    }

    /// Stop refreshing and deregister.
    ///
    /// Safe to call repeatedly and before `start`; only the first call after a
    /// successful `start` touches the registry. Once this returns no further
    /// refresh is issued. The deregistration error is returned for logging.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut lease) = self.lease.take() else {
            return Ok(());
        };

        lease.stop.cancel();
        if let Some(task) = lease.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("Heartbeat refresh loop panicked");
                }
            }
        }

        let result = call_with_timeout(
            "deregister",
            self.config.call_timeout,
            self.registry.deregister(&lease.descriptor),
        )
        .await;

        self.state.send_replace(LeaseState::Deregistered);
        if result.is_ok() {
            if let Some(metrics) = &self.metrics {
                metrics.record_deregistration();
            }
            tracing::info!(
                service = %lease.descriptor.name,
                node_id = %lease.descriptor.node_id,
                "Deregistered service"
            );
        }
        result
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(lease) = &self.lease {
            lease.stop.cancel();
        }
    }
}

struct RefreshLoop {
    registry: Arc<dyn RegistryClient>,
    descriptor: ServiceDescriptor,
    ttl: Duration,
    interval: Duration,
    call_timeout: Duration,
    max_failures: Option<u32>,
    state: Arc<watch::Sender<LeaseState>>,
    metrics: Option<Arc<LifecycleMetrics>>,
    escalation: Option<ShutdownTrigger>,
    stop: CancellationToken,
}

impl RefreshLoop {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_success = Instant::now();
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.state.send_replace(LeaseState::Refreshing);

            let outcome = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                r = call_with_timeout(
                    "refresh",
                    self.call_timeout,
                    self.registry.register(&self.descriptor, self.ttl),
                ) => r,
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_refresh(outcome.is_ok());
            }

            match outcome {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(failures, "Registration refresh recovered");
                    }
                    failures = 0;
                    last_success = Instant::now();
                    self.state.send_replace(LeaseState::Registered);
                    tracing::trace!(node_id = %self.descriptor.node_id, "Registration refreshed");
                }
                Err(e) => {
                    failures += 1;
                    let expired = last_success.elapsed() >= self.ttl;
                    self.state.send_replace(if expired {
                        LeaseState::Expired
                    } else {
                        LeaseState::Registered
                    });
                    tracing::warn!(
                        error = %e,
                        failures,
                        expired,
                        "Failed to refresh registration"
                    );

                    if self.max_failures.is_some_and(|max| failures >= max) {
                        tracing::error!(
                            failures,
                            "Refresh failure limit reached, requesting shutdown"
                        );
                        if let Some(trigger) = &self.escalation {
                            trigger.fire(TerminationReason::HeartbeatFailed(e.to_string()));
                        }
                        break;
                    }
                }
            }
        }

        tracing::debug!("Heartbeat refresh loop stopped");
    }
}

async fn call_with_timeout<F>(operation: &'static str, limit: Duration, call: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ChaosError::timeout(operation, limit)),
    }
}
