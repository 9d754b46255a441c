//! CHAOS service runtime.
//!
//! Wires configuration into a [`LifecycleController`]:
//! - HTTP listener with the application router plus `/health`, `/version` and `/metrics`
//! - Registration heartbeat when `[discovery]` is configured
//! - Ordered shutdown on SIGINT, SIGTERM, SIGQUIT or an explicit stop

use std::future::Future;
use std::sync::Arc;

use axum::Router;

use chaos_core::config::ChaosConfig;
use chaos_core::error::{ChaosError, Result};
use chaos_core::{BuildInfo, TerminationReason};
use chaos_runtime::heartbeat::{Heartbeat, HeartbeatConfig};
use chaos_runtime::hooks::{FnHook, LifecycleMetrics, ShutdownHook};
use chaos_runtime::lifecycle::{LifecycleController, Registration};
use chaos_runtime::listener::{service_router, HttpListener, ServiceState};
use chaos_runtime::registry::{EtcdRegistry, RegistryClient};
use chaos_runtime::shutdown::ShutdownTrigger;
use chaos_runtime::signals::shutdown_signal;

/// Prelude module for common imports.
pub mod prelude {
    pub use axum::{routing, Json, Router};

    pub use chaos_core::config::ChaosConfig;
    pub use chaos_core::error::{ChaosError, Result};
    pub use chaos_core::{LifecycleState, TerminationReason};
    pub use chaos_runtime::hooks::{FnHook, ShutdownHook};

    pub use crate::{Chaos, ChaosBuilder};
}

/// A configured service, ready to run.
pub struct Chaos {
    config: ChaosConfig,
    router: Router,
    registry: Option<Arc<dyn RegistryClient>>,
    hooks: Vec<Arc<dyn ShutdownHook>>,
    metrics: Arc<LifecycleMetrics>,
    trigger: ShutdownTrigger,
}

impl Chaos {
    /// Create a new builder.
    pub fn builder() -> ChaosBuilder {
        ChaosBuilder::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Lifecycle counters served at `/metrics`.
    pub fn metrics(&self) -> Arc<LifecycleMetrics> {
        self.metrics.clone()
    }

    /// Trigger that stops the service when fired.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.trigger.fire(TerminationReason::Stop);
    }

    /// Run until an OS termination signal or another trigger.
    pub async fn run(self) -> Result<TerminationReason> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `signal` resolves or another trigger fires.
    pub async fn run_until<S>(self, signal: S) -> Result<TerminationReason>
    where
        S: Future<Output = TerminationReason> + Send + 'static,
    {
        let mut controller = self.into_controller()?;
        controller.run(signal).await
    }

    /// Assemble the lifecycle controller without starting it.
    pub fn into_controller(self) -> Result<LifecycleController> {
        let service = &self.config.service;
        let addr = service.bind_addr()?;

        let state = ServiceState {
            build_info: Arc::new(BuildInfo::for_service(service)),
            metrics: self.metrics.clone(),
            trigger: self.trigger.clone(),
        };
        let router = service_router(self.router, state, service.log_request_time);
        let listener = Arc::new(HttpListener::new(addr, router));

        let mut controller = LifecycleController::new(
            listener,
            self.trigger.clone(),
            self.config.lifecycle.shutdown_deadline(),
        );

        match self.config.active_discovery() {
            Some(discovery) => {
                let registry: Arc<dyn RegistryClient> = match self.registry {
                    Some(registry) => registry,
                    None => {
                        let etcd = EtcdRegistry::from_config(discovery)?;
                        tracing::debug!(endpoints = ?etcd.endpoints(), "etcd registry configured");
                        Arc::new(etcd)
                    }
                };
                tracing::info!(
                    backend = registry.backend(),
                    name = %service.registered_name(),
                    ttl_secs = discovery.ttl_secs,
                    refresh_interval_secs = discovery.refresh_interval_secs,
                    "Service discovery enabled"
                );

                let heartbeat = Heartbeat::new(registry, HeartbeatConfig::from_discovery(discovery))
                    .with_metrics(self.metrics.clone());
                controller = controller.with_registration(Registration::from_config(
                    heartbeat, service, discovery,
                ));
            }
            None => {
                if self.registry.is_some() {
                    tracing::warn!("Registry provided but discovery is not configured, ignoring it");
                }
                tracing::info!("Service discovery disabled");
            }
        }

        for hook in self.hooks {
            controller = controller.with_hook(hook);
        }
        Ok(controller.with_hook(self.metrics))
    }
}

/// Builder for configuring the CHAOS runtime.
pub struct ChaosBuilder {
    config: Option<ChaosConfig>,
    router: Router,
    registry: Option<Arc<dyn RegistryClient>>,
    hooks: Vec<Arc<dyn ShutdownHook>>,
}

impl ChaosBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            router: Router::new(),
            registry: None,
            hooks: Vec::new(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: ChaosConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Application routes, served next to the built-in ones.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Use `registry` instead of the etcd client built from `[discovery]`.
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Notify `hook` at the end of shutdown.
    pub fn on_shutdown(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Run `f` at the end of shutdown.
    pub fn on_shutdown_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_shutdown(Arc::new(FnHook::new(name, f)))
    }

    /// Build the runtime.
    pub fn build(self) -> Result<Chaos> {
        let config = self
            .config
            .ok_or_else(|| ChaosError::Config("Configuration is required".to_string()))?;
        config.validate()?;

        Ok(Chaos {
            config,
            router: self.router,
            registry: self.registry,
            hooks: self.hooks,
            metrics: Arc::new(LifecycleMetrics::new()),
            trigger: ShutdownTrigger::new(),
        })
    }
}

impl Default for ChaosBuilder {
    fn default() -> Self {
        Self::new()
    }
}
