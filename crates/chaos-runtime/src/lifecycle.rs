//! Service lifecycle: startup ordering, waiting for termination, ordered shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chaos_core::config::{resolve_advertised_address, DiscoveryConfig, ServiceConfig};
use chaos_core::{
    ChaosError, LifecycleState, NodeId, Result, ServiceDescriptor, TerminationReason,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::heartbeat::Heartbeat;
use crate::hooks::ShutdownHook;
use crate::listener::Listener;
use crate::shutdown::ShutdownTrigger;

/// Extra time granted on top of the drain deadline before the controller
/// stops waiting on the listener.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Everything needed to publish this process once the listener is bound.
pub struct Registration {
    heartbeat: Heartbeat,
    name: String,
    version: String,
    advertise_address: Option<String>,
    node_id: NodeId,
    ttl: Duration,
    refresh_interval: Duration,
}

impl Registration {
    pub fn new(
        heartbeat: Heartbeat,
        name: impl Into<String>,
        version: impl Into<String>,
        ttl: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            heartbeat,
            name: name.into(),
            version: version.into(),
            advertise_address: None,
            node_id: NodeId::new(),
            ttl,
            refresh_interval,
        }
    }

    /// Build from configuration around an existing heartbeat.
    pub fn from_config(
        heartbeat: Heartbeat,
        service: &ServiceConfig,
        discovery: &DiscoveryConfig,
    ) -> Self {
        let mut registration = Self::new(
            heartbeat,
            service.registered_name(),
            service.version.clone(),
            discovery.ttl(),
            discovery.refresh_interval(),
        );
        registration.advertise_address = service.advertise_address.clone();
        registration
    }

    /// Publish `address` instead of one derived from the bound socket.
    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    fn descriptor(&self, bound: SocketAddr) -> ServiceDescriptor {
        let address = resolve_advertised_address(self.advertise_address.as_deref(), bound);
        ServiceDescriptor::with_node_id(&self.name, &self.version, address, self.node_id)
    }
}

/// Drives a listener and an optional registration through their lifecycle.
///
/// Startup binds the listener, starts serving, then registers. Shutdown
/// deregisters first, then drains the listener, then notifies hooks, so the
/// registry never lists a node that is no longer accepting.
pub struct LifecycleController {
    listener: Arc<dyn Listener>,
    trigger: ShutdownTrigger,
    shutdown_deadline: Duration,
    registration: Option<Registration>,
    hooks: Vec<Arc<dyn ShutdownHook>>,
    state: watch::Sender<LifecycleState>,
    serve_task: Option<JoinHandle<()>>,
}

impl LifecycleController {
    pub fn new(
        listener: Arc<dyn Listener>,
        trigger: ShutdownTrigger,
        shutdown_deadline: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            listener,
            trigger,
            shutdown_deadline,
            registration: None,
            hooks: Vec::new(),
            state,
            serve_task: None,
        }
    }

    /// Register with discovery after the listener is up.
    pub fn with_registration(mut self, mut registration: Registration) -> Self {
        registration.heartbeat.set_escalation(self.trigger.clone());
        self.registration = Some(registration);
        self
    }

    /// Notify `hook` at the end of shutdown.
    pub fn with_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn trigger(&self) -> &ShutdownTrigger {
        &self.trigger
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Cloneable handle for observing and stopping the controller.
    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            trigger: self.trigger.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Bind, serve and register.
    ///
    /// A bind or initial registration failure fires the trigger, runs the
    /// ordered shutdown and returns the error. The state is then `Stopped`.
    pub async fn start(&mut self) -> Result<()> {
        let current = self.state();
        if current != LifecycleState::NotStarted {
            return Err(ChaosError::InvalidState(format!(
                "cannot start a controller that is {}",
                current
            )));
        }
        self.transition(LifecycleState::Starting);

        let bound = match self.listener.bind().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "Failed to bind listener");
                let reason = TerminationReason::ListenerFailed(e.to_string());
                return self.abort_start(reason, e).await;
            }
        };
        self.spawn_serve();

        if let Some(registration) = self.registration.as_mut() {
            let descriptor = registration.descriptor(bound);
            let started = registration
                .heartbeat
                .start(descriptor, registration.ttl, registration.refresh_interval)
                .await;
            if let Err(e) = started {
                tracing::error!(error = %e, "Initial registration failed");
                let reason = TerminationReason::RegistrationFailed(e.to_string());
                return self.abort_start(reason, e).await;
            }
        }

        self.transition(LifecycleState::Running);
        tracing::info!(
            addr = %bound,
            discovery = self.registration.is_some(),
            "Service running"
        );
        Ok(())
    }

    /// Start, block until the trigger fires, then shut down.
    ///
    /// `signal` is forwarded onto the trigger when it resolves. Returns the
    /// reason that ended the run, or the fatal startup error.
    pub async fn run<S>(&mut self, signal: S) -> Result<TerminationReason>
    where
        S: Future<Output = TerminationReason> + Send + 'static,
    {
        let forward = {
            let trigger = self.trigger.clone();
            tokio::spawn(async move {
                let reason = signal.await;
                trigger.fire(reason);
            })
        };

        let result = match self.start().await {
            Ok(()) => {
                let reason = self.trigger.wait().await;
                self.shutdown().await;
                Ok(reason)
            }
            Err(e) => Err(e),
        };

        forward.abort();
        result
    }

    /// Run the ordered shutdown sequence.
    ///
    /// No-op before `start` and once shutdown has begun.
    pub async fn shutdown(&mut self) {
        let current = self.state();
        if current == LifecycleState::NotStarted || current.is_terminating() {
            tracing::debug!(state = %current, "Shutdown skipped");
            return;
        }

        self.trigger.fire(TerminationReason::Stop);
        self.transition(LifecycleState::ShuttingDown);
        let reason = self.trigger.reason().unwrap_or(TerminationReason::Stop);
        tracing::info!(reason = %reason, "Shutting down");

        if let Some(registration) = self.registration.as_mut() {
            if let Err(e) = registration.heartbeat.stop().await {
                tracing::warn!(error = %e, "Failed to deregister, registry TTL will expire it");
            }
        }

        let limit = self.shutdown_deadline + SHUTDOWN_GRACE;
        match tokio::time::timeout(limit, self.listener.shutdown(self.shutdown_deadline)).await {
            Ok(Ok(())) => tracing::debug!("Listener drained"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Listener did not drain cleanly"),
            Err(_) => tracing::warn!(
                deadline = ?self.shutdown_deadline,
                "Listener shutdown did not return in time"
            ),
        }

        if let Some(mut task) = self.serve_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Serve task still running, aborting");
                task.abort();
            }
        }

        for hook in &self.hooks {
            let notified = std::panic::catch_unwind(AssertUnwindSafe(|| hook.on_shutdown()));
            if notified.is_err() {
                tracing::warn!(hook = hook.name(), "Shutdown hook panicked");
            }
        }

        self.transition(LifecycleState::Stopped);
        tracing::info!("Shutdown complete");
    }

    async fn abort_start(&mut self, reason: TerminationReason, error: ChaosError) -> Result<()> {
        self.trigger.fire(reason);
        self.shutdown().await;
        Err(error)
    }

    fn spawn_serve(&mut self) {
        let listener = self.listener.clone();
        let trigger = self.trigger.clone();

        self.serve_task = Some(tokio::spawn(async move {
            let result = listener.serve().await;
            if trigger.is_fired() {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Listener exited with error during shutdown");
                }
                return;
            }

            let message = match result {
                Ok(()) => "listener stopped unexpectedly".to_string(),
                Err(e) => {
                    tracing::error!(error = %e, "Listener failed");
                    e.to_string()
                }
            };
            trigger.fire(TerminationReason::ListenerFailed(message));
        }));
    }

    fn transition(&self, next: LifecycleState) {
        let moved = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if !moved {
            tracing::debug!(from = %self.state(), to = %next, "Ignored lifecycle transition");
        }
    }
}

/// Cloneable view of a running [`LifecycleController`].
#[derive(Clone)]
pub struct LifecycleHandle {
    trigger: ShutdownTrigger,
    state: watch::Receiver<LifecycleState>,
}

impl LifecycleHandle {
    /// Request shutdown. Returns `false` if shutdown was already triggered.
    pub fn stop(&self) -> bool {
        self.trigger.fire(TerminationReason::Stop)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.trigger.is_fired() || self.state().is_terminating()
    }

    /// Wait until the controller reaches `target` or a later state.
    pub async fn wait_for(&self, target: LifecycleState) -> LifecycleState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s >= target).await.map(|s| *s);
        reached.unwrap_or_else(|_| *rx.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatConfig;
    use crate::hooks::LifecycleMetrics;
    use crate::testing::{CallLog, MockListener, MockRegistry, RecordingHook};
    use chaos_core::LeaseState;

    const DEADLINE: Duration = Duration::from_millis(300);

    struct Fixture {
        log: CallLog,
        registry: MockRegistry,
        listener: Arc<MockListener>,
    }

    impl Fixture {
        fn new() -> Self {
            let log = CallLog::new();
            Self {
                registry: MockRegistry::with_log(log.clone()),
                listener: Arc::new(MockListener::new(log.clone())),
                log,
            }
        }

        fn registration(&self, refresh_interval: Duration) -> Registration {
            let heartbeat = Heartbeat::new(
                Arc::new(self.registry.clone()),
                HeartbeatConfig {
                    call_timeout: Duration::from_millis(200),
                    max_refresh_failures: None,
                },
            );
            Registration::new(
                heartbeat,
                "orders",
                "1.0",
                Duration::from_secs(5),
                refresh_interval,
            )
        }

        fn controller(&self) -> LifecycleController {
            LifecycleController::new(self.listener.clone(), ShutdownTrigger::new(), DEADLINE)
                .with_hook(Arc::new(RecordingHook::new("metrics", self.log.clone())))
        }

        fn with_discovery(&self, refresh_interval: Duration) -> LifecycleController {
            self.controller()
                .with_registration(self.registration(refresh_interval))
        }
    }

    #[tokio::test]
    async fn test_start_without_discovery_never_touches_registry() {
        let fx = Fixture::new();
        let mut controller = fx.controller();

        controller.start().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert!(controller.registration().is_none());

        controller.shutdown().await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(fx.registry.register_count(), 0);
        assert_eq!(fx.registry.deregister_count(), 0);
        assert_eq!(
            fx.log.entries(),
            vec!["bind", "listener_shutdown", "on_shutdown:metrics"]
        );
    }

    #[tokio::test]
    async fn test_start_with_discovery_registers_then_refreshes() {
        let fx = Fixture::new();
        let mut controller = fx.with_discovery(Duration::from_millis(50));

        controller.start().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert_eq!(fx.registry.register_count(), 1);

        let registration = controller.registration().unwrap();
        assert_eq!(registration.heartbeat().state(), LeaseState::Registered);
        let lease = registration.heartbeat().lease().unwrap();
        assert_eq!(lease.descriptor.name, "orders");
        assert_eq!(lease.descriptor.node_id, registration.node_id());
        assert_eq!(lease.descriptor.advertised_address, fx.listener.addr().to_string());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fx.registry.register_count(), 2);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal_with_cleanup() {
        let fx = Fixture::new();
        fx.registry.fail_register(true);
        let mut controller = fx.with_discovery(Duration::from_millis(50));
        let handle = controller.handle();

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ChaosError::Registry(_)));
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(matches!(
            controller.trigger().reason(),
            Some(TerminationReason::RegistrationFailed(_))
        ));

        let entries = fx.log.entries();
        assert!(entries.contains(&"listener_shutdown".to_string()));
        assert!(!entries.contains(&"deregister".to_string()));
        assert_eq!(handle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let fx = Fixture::new();
        fx.listener.fail_bind();
        let mut controller = fx.with_discovery(Duration::from_millis(50));

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ChaosError::Listener(_)));
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(fx.registry.register_count(), 0);
        assert!(matches!(
            controller.trigger().reason(),
            Some(TerminationReason::ListenerFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_signal_drives_ordered_shutdown() {
        let fx = Fixture::new();
        let mut controller = fx.with_discovery(Duration::from_secs(10));
        let handle = controller.handle();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            let reason = controller
                .run(async move {
                    let _ = rx.await;
                    TerminationReason::Signal("SIGTERM")
                })
                .await;
            (controller, reason)
        });

        handle.wait_for(LifecycleState::Running).await;
        tx.send(()).unwrap();

        let (controller, reason) = run.await.unwrap();
        assert_eq!(reason.unwrap(), TerminationReason::Signal("SIGTERM"));
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(
            fx.log.entries(),
            vec![
                "bind",
                "register",
                "deregister",
                "listener_shutdown",
                "on_shutdown:metrics"
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_triggers_shut_down_once() {
        let fx = Fixture::new();
        let mut controller = fx.with_discovery(Duration::from_secs(10));
        let handle = controller.handle();
        let trigger = controller.trigger().clone();

        let run = tokio::spawn(async move {
            let reason = controller.run(std::future::pending()).await;
            (controller, reason)
        });

        handle.wait_for(LifecycleState::Running).await;
        assert!(trigger.fire(TerminationReason::Signal("SIGINT")));
        assert!(!trigger.fire(TerminationReason::Signal("SIGTERM")));
        assert!(!handle.stop());

        let (mut controller, reason) = run.await.unwrap();
        assert_eq!(reason.unwrap(), TerminationReason::Signal("SIGINT"));

        controller.shutdown().await;
        assert_eq!(fx.log.count("deregister"), 1);
        assert_eq!(fx.log.count("listener_shutdown"), 1);
        assert_eq!(fx.log.count("on_shutdown:metrics"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let fx = Fixture::new();
        let mut controller = fx.with_discovery(Duration::from_secs(10));

        controller.shutdown().await;
        assert_eq!(controller.state(), LifecycleState::NotStarted);
        assert!(fx.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let fx = Fixture::new();
        let mut controller = fx.controller();

        controller.start().await.unwrap();
        assert!(matches!(
            controller.start().await,
            Err(ChaosError::InvalidState(_))
        ));
        controller.shutdown().await;
        assert!(matches!(
            controller.start().await,
            Err(ChaosError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_hanging_listener_does_not_block_shutdown() {
        let fx = Fixture::new();
        fx.listener.hang_on_shutdown();
        let mut controller = fx.with_discovery(Duration::from_secs(10));

        controller.start().await.unwrap();
        let started = std::time::Instant::now();
        controller.shutdown().await;

        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(started.elapsed() < DEADLINE + SHUTDOWN_GRACE * 3);
        assert_eq!(fx.log.count("on_shutdown:metrics"), 1);
    }

    #[tokio::test]
    async fn test_no_refresh_after_shutdown() {
        let fx = Fixture::new();
        let mut controller = fx.with_discovery(Duration::from_millis(20));

        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown().await;

        let after = fx.registry.register_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.registry.register_count(), after);
    }

    #[tokio::test]
    async fn test_deregister_failure_does_not_fail_shutdown() {
        let fx = Fixture::new();
        fx.registry.fail_deregister(true);
        let mut controller = fx.with_discovery(Duration::from_secs(10));

        controller.start().await.unwrap();
        controller.shutdown().await;

        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(fx.log.count("listener_shutdown"), 1);
    }

    #[tokio::test]
    async fn test_listener_failure_after_start_triggers_shutdown() {
        let fx = Fixture::new();
        let mut controller = fx.with_discovery(Duration::from_secs(10));
        let listener = fx.listener.clone();

        let run = tokio::spawn(async move { controller.run(std::future::pending()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.fail_serving("connection reset");

        let reason = run.await.unwrap().unwrap();
        assert!(matches!(reason, TerminationReason::ListenerFailed(_)));
        assert_eq!(fx.log.count("deregister"), 1);
    }

    #[tokio::test]
    async fn test_refresh_escalation_stops_the_service() {
        let fx = Fixture::new();
        let heartbeat = Heartbeat::new(
            Arc::new(fx.registry.clone()),
            HeartbeatConfig {
                call_timeout: Duration::from_millis(100),
                max_refresh_failures: Some(2),
            },
        );
        let registration = Registration::new(
            heartbeat,
            "orders",
            "",
            Duration::from_secs(5),
            Duration::from_millis(20),
        );
        let mut controller = fx.controller().with_registration(registration);
        let handle = controller.handle();
        let registry = fx.registry.clone();

        let run = tokio::spawn(async move { controller.run(std::future::pending()).await });

        handle.wait_for(LifecycleState::Running).await;
        registry.fail_register(true);

        let reason = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(reason, TerminationReason::HeartbeatFailed(_)));
        assert_eq!(handle.wait_for(LifecycleState::Stopped).await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_handle_stop_and_hooks() {
        let fx = Fixture::new();
        let metrics = Arc::new(LifecycleMetrics::new());
        let mut controller = fx.controller().with_hook(metrics.clone());
        let handle = controller.handle();
        assert!(!handle.is_shutting_down());

        let run = tokio::spawn(async move { controller.run(std::future::pending()).await });

        handle.wait_for(LifecycleState::Running).await;
        assert!(handle.stop());
        assert!(handle.is_shutting_down());

        assert_eq!(run.await.unwrap().unwrap(), TerminationReason::Stop);
        assert_eq!(handle.state(), LifecycleState::Stopped);
        assert!(metrics.is_closed());
    }

    #[test]
    fn test_descriptor_uses_explicit_advertise_address() {
        let fx = Fixture::new();
        let registration = fx
            .registration(Duration::ZERO)
            .with_advertise_address("10.1.2.3:9000");
        let descriptor = registration.descriptor("0.0.0.0:8080".parse().unwrap());
        assert_eq!(descriptor.advertised_address, "10.1.2.3:9000");
        assert_eq!(descriptor.version, "1.0");
        assert_eq!(descriptor.node_id, registration.node_id());
    }

    #[test]
    fn test_registration_from_config_uses_env_name() {
        let config = chaos_core::ChaosConfig::parse_toml(
            r#"
            [service]
            name = "orders"
            env = "dev"
            advertise_address = "10.0.0.7:8080"

            [discovery]
            endpoints = ["127.0.0.1:2379"]
            ttl_secs = 10
            refresh_interval_secs = 3
            "#,
        )
        .unwrap();
        let discovery = config.active_discovery().unwrap();
        let heartbeat = Heartbeat::new(
            Arc::new(MockRegistry::new()),
            HeartbeatConfig::from_discovery(discovery),
        );
        let registration = Registration::from_config(heartbeat, &config.service, discovery);

        let descriptor = registration.descriptor("0.0.0.0:8080".parse().unwrap());
        assert_eq!(descriptor.name, "orders.dev");
        assert_eq!(descriptor.advertised_address, "10.0.0.7:8080");
        assert_eq!(registration.ttl, Duration::from_secs(10));
        assert_eq!(registration.refresh_interval, Duration::from_secs(3));
    }
}
