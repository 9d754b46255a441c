//! Observability collaborators notified at shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Collaborator told that the process is stopping so it can flush and release.
///
/// Called once, synchronously, at the end of the shutdown sequence.
/// Implementations must not block.
pub trait ShutdownHook: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Flush and release resources.
    fn on_shutdown(&self);
}

/// Shutdown hook from a closure.
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn() + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ShutdownHook for FnHook<F>
where
    F: Fn() + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_shutdown(&self) {
        (self.f)()
    }
}

/// In-process counters for registration and request activity.
///
/// Exposed at `/metrics` and logged once more when shut down.
pub struct LifecycleMetrics {
    started_at: DateTime<Utc>,
    registrations: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    deregistrations: AtomicU64,
    requests: AtomicU64,
    request_micros: AtomicU64,
    requests_by_path: Mutex<BTreeMap<String, u64>>,
    closed: AtomicBool,
}

/// Point-in-time copy of [`LifecycleMetrics`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub registrations: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub deregistrations: u64,
    pub requests: u64,
    pub avg_request_ms: f64,
    pub requests_by_path: BTreeMap<String, u64>,
    pub closed: bool,
}

impl Default for LifecycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            registrations: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            deregistrations: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            request_micros: AtomicU64::new(0),
            requests_by_path: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self, ok: bool) {
        if ok {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deregistration(&self) {
        self.deregistrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one served request under `route`.
    ///
    /// `route` must come from a bounded set, such as the matched route
    /// template, never the raw request path.
    pub fn record_request(&self, route: &str, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.request_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if let Ok(mut by_path) = self.requests_by_path.lock() {
            match by_path.get_mut(route) {
                Some(count) => *count += 1,
                None => {
                    by_path.insert(route.to_string(), 1);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let micros = self.request_micros.load(Ordering::Relaxed);
        let avg_request_ms = if requests == 0 {
            0.0
        } else {
            micros as f64 / requests as f64 / 1000.0
        };

        MetricsSnapshot {
            started_at: self.started_at,
            registrations: self.registrations.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            requests,
            avg_request_ms,
            requests_by_path: self
                .requests_by_path
                .lock()
                .map(|m| m.clone())
                .unwrap_or_default(),
            closed: self.is_closed(),
        }
    }
}

impl ShutdownHook for LifecycleMetrics {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let snapshot = self.snapshot();
        tracing::info!(
            registrations = snapshot.registrations,
            refreshes = snapshot.refreshes,
            refresh_failures = snapshot.refresh_failures,
            deregistrations = snapshot.deregistrations,
            requests = snapshot.requests,
            avg_request_ms = snapshot.avg_request_ms,
            "Final lifecycle metrics"
        );
    }
}
