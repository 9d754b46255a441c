use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chaos_core::{ChaosError, NodeId, Result, ServiceDescriptor};
use tokio::time::Instant;

use super::RegistryClient;

struct Entry {
    descriptor: ServiceDescriptor,
    expires_at: Instant,
}

/// Process-local registry with TTL expiry.
///
/// Useful for single-node development and as the registry in tests. Entries
/// whose TTL has elapsed are invisible to lookups and pruned on write.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    entries: Arc<RwLock<HashMap<(String, NodeId), Entry>>>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live nodes registered under `name`.
    pub fn lookup(&self, name: &str) -> Vec<ServiceDescriptor> {
        let now = Instant::now();
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut nodes: Vec<ServiceDescriptor> = entries
            .iter()
            .filter(|((n, _), e)| n == name && e.expires_at > now)
            .map(|(_, e)| e.descriptor.clone())
            .collect();
        nodes.sort_by(|a, b| a.advertised_address.cmp(&b.advertised_address));
        nodes
    }

    /// Number of live entries across all services.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        match self.entries.read() {
            Ok(entries) => entries.values().filter(|e| e.expires_at > now).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .values()
                .filter(|e| e.expires_at > now)
                .count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(&self, descriptor: &ServiceDescriptor, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ChaosError::Internal("registry lock poisoned".to_string()))?;

        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            (descriptor.name.clone(), descriptor.node_id),
            Entry {
                descriptor: descriptor.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn remove(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ChaosError::Internal("registry lock poisoned".to_string()))?;
        entries.remove(&(descriptor.name.clone(), descriptor.node_id));
        Ok(())
    }
}

impl RegistryClient for InMemoryRegistry {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn register<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.upsert(descriptor, ttl) })
    }

    fn deregister<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.remove(descriptor) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(addr: &str) -> ServiceDescriptor {
        ServiceDescriptor::new("orders", "1.0", addr)
    }

    #[tokio::test]
    async fn test_reregister_does_not_duplicate() {
        let registry = InMemoryRegistry::new();
        let desc = descriptor("10.0.0.1:8080");

        registry.register(&desc, Duration::from_secs(30)).await.unwrap();
        registry.register(&desc, Duration::from_secs(30)).await.unwrap();

        assert_eq!(registry.lookup("orders"), vec![desc]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_nodes_are_listed() {
        let registry = InMemoryRegistry::new();
        let a = descriptor("10.0.0.1:8080");
        let b = descriptor("10.0.0.2:8080");

        registry.register(&a, Duration::from_secs(30)).await.unwrap();
        registry.register(&b, Duration::from_secs(30)).await.unwrap();

        assert_eq!(registry.lookup("orders"), vec![a, b]);
        assert!(registry.lookup("billing").is_empty());
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let desc = descriptor("10.0.0.1:8080");

        registry.register(&desc, Duration::from_secs(30)).await.unwrap();
        registry.deregister(&desc).await.unwrap();
        registry.deregister(&desc).await.unwrap();

        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_without_refresh() {
        let registry = InMemoryRegistry::new();
        let desc = descriptor("10.0.0.1:8080");

        registry.register(&desc, Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.len(), 1);

        registry.register(&desc, Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.lookup("orders").is_empty());
    }
}
