//! Recording test doubles for the lifecycle collaborators.
//!
//! All doubles can share one [`CallLog`] so tests can assert on the order in
//! which the controller touched them.
//!
//! # Example
//!
//! ```ignore
//! let log = CallLog::new();
//! let registry = MockRegistry::with_log(log.clone());
//! let listener = Arc::new(MockListener::new(log.clone()));
//! // ... drive a LifecycleController ...
//! assert_eq!(log.entries(), vec!["bind", "register", "deregister", "listener_shutdown"]);
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chaos_core::{ChaosError, Result, ServiceDescriptor};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::hooks::ShutdownHook;
use crate::listener::Listener;
use crate::registry::RegistryClient;

/// Ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of entries equal to `name`.
    pub fn count(&self, name: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == name).count()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Registry double with switchable failures.
///
/// Every attempt is counted and logged, failed or not.
#[derive(Clone, Default)]
pub struct MockRegistry {
    log: CallLog,
    fail_register: Arc<AtomicBool>,
    fail_deregister: Arc<AtomicBool>,
    registers: Arc<AtomicUsize>,
    deregisters: Arc<AtomicUsize>,
    register_delay: Arc<RwLock<Duration>>,
    last: Arc<RwLock<Option<ServiceDescriptor>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deregister(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to each `register` call before it answers.
    pub fn set_register_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.register_delay.write() {
            *d = delay;
        }
    }

    pub fn register_count(&self) -> usize {
        self.registers.load(Ordering::SeqCst)
    }

    pub fn deregister_count(&self) -> usize {
        self.deregisters.load(Ordering::SeqCst)
    }

    /// Descriptor from the most recent register call.
    pub fn last_descriptor(&self) -> Option<ServiceDescriptor> {
        self.last.read().ok().and_then(|d| d.clone())
    }

    async fn record_register(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        self.log.record("register");
        if let Ok(mut last) = self.last.write() {
            *last = Some(descriptor.clone());
        }

        let delay = self.register_delay.read().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_register.load(Ordering::SeqCst) {
            return Err(ChaosError::Registry("mock register failure".to_string()));
        }
        Ok(())
    }

    async fn record_deregister(&self) -> Result<()> {
        self.deregisters.fetch_add(1, Ordering::SeqCst);
        self.log.record("deregister");

        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(ChaosError::Registry("mock deregister failure".to_string()));
        }
        Ok(())
    }
}

impl RegistryClient for MockRegistry {
    fn backend(&self) -> &'static str {
        "mock"
    }

    fn register<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
        _ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.record_register(descriptor))
    }

    fn deregister<'a>(
        &'a self,
        _descriptor: &'a ServiceDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.record_deregister())
    }
}

/// Listener double that serves until shut down.
pub struct MockListener {
    log: CallLog,
    addr: SocketAddr,
    fail_bind: AtomicBool,
    hang_on_shutdown: AtomicBool,
    closed: CancellationToken,
    failure: watch::Sender<Option<String>>,
}

impl MockListener {
    pub fn new(log: CallLog) -> Self {
        let (failure, _) = watch::channel(None);
        Self {
            log,
            addr: SocketAddr::from(([127, 0, 0, 1], 18080)),
            fail_bind: AtomicBool::new(false),
            hang_on_shutdown: AtomicBool::new(false),
            closed: CancellationToken::new(),
            failure,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn fail_bind(&self) {
        self.fail_bind.store(true, Ordering::SeqCst);
    }

    /// Make `shutdown` never return.
    pub fn hang_on_shutdown(&self) {
        self.hang_on_shutdown.store(true, Ordering::SeqCst);
    }

    /// Make a running `serve` return an error.
    pub fn fail_serving(&self, message: impl Into<String>) {
        self.failure.send_replace(Some(message.into()));
    }

    async fn record_bind(&self) -> Result<SocketAddr> {
        self.log.record("bind");
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(ChaosError::Listener(format!(
                "failed to bind {}: address in use",
                self.addr
            )));
        }
        Ok(self.addr)
    }

    async fn wait_closed(&self) -> Result<()> {
        let mut failure = self.failure.subscribe();
        tokio::select! {
            _ = self.closed.cancelled() => Ok(()),
            failed = failure.wait_for(|f| f.is_some()) => {
                let message = failed.ok().and_then(|f| f.clone()).unwrap_or_default();
                Err(ChaosError::Listener(message))
            }
        }
    }

    async fn record_shutdown(&self) -> Result<()> {
        self.log.record("listener_shutdown");
        if self.hang_on_shutdown.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.closed.cancel();
        Ok(())
    }
}

impl Listener for MockListener {
    fn bind<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<SocketAddr>> + Send + 'a>> {
        Box::pin(self.record_bind())
    }

    fn serve<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.wait_closed())
    }

    fn shutdown<'a>(
        &'a self,
        _deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.record_shutdown())
    }
}

/// Hook that logs `on_shutdown:<name>`.
pub struct RecordingHook {
    name: String,
    log: CallLog,
}

impl RecordingHook {
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }
}

impl ShutdownHook for RecordingHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_shutdown(&self) {
        self.log.record(format!("on_shutdown:{}", self.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_registry_records_calls() {
        let log = CallLog::new();
        let registry = MockRegistry::with_log(log.clone());
        let desc = ServiceDescriptor::new("orders", "1.0", "127.0.0.1:8080");

        registry.register(&desc, Duration::from_secs(1)).await.unwrap();
        registry.fail_register(true);
        assert!(registry.register(&desc, Duration::from_secs(1)).await.is_err());
        registry.deregister(&desc).await.unwrap();

        assert_eq!(registry.register_count(), 2);
        assert_eq!(registry.deregister_count(), 1);
        assert_eq!(registry.last_descriptor(), Some(desc));
        assert_eq!(log.entries(), vec!["register", "register", "deregister"]);

        log.clear();
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_mock_listener_serves_until_shutdown() {
        let log = CallLog::new();
        let listener = Arc::new(MockListener::new(log.clone()));
        listener.bind().await.unwrap();

        let serving = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.serve().await })
        };
        tokio::task::yield_now().await;
        assert!(!serving.is_finished());

        listener.shutdown(Duration::from_secs(1)).await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(log.entries(), vec!["bind", "listener_shutdown"]);
    }

    #[tokio::test]
    async fn test_mock_listener_failure() {
        let listener = MockListener::new(CallLog::new());
        listener.fail_serving("boom");
        let err = listener.serve().await.unwrap_err();
        assert_eq!(err.to_string(), ChaosError::Listener("boom".into()).to_string());
    }
}
