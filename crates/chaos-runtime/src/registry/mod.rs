//! Service registry clients.
//!
//! A registry stores one record per `(service name, node id)` with a TTL.
//! Registering the same descriptor again refreshes that record instead of
//! creating a second one, which is what the heartbeat relies on.

mod etcd;
mod memory;

pub use etcd::EtcdRegistry;
pub use memory::InMemoryRegistry;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chaos_core::{Result, ServiceDescriptor};

/// Client for a registry with lease/TTL semantics.
pub trait RegistryClient: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Register or refresh `descriptor` with the given TTL.
    ///
    /// Must be an idempotent upsert keyed by service name and node id.
    fn register<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove `descriptor` from the registry. Removing an absent entry is not an error.
    fn deregister<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
