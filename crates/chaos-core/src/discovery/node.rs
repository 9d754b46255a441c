use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version advertised when none is configured.
pub const DEFAULT_VERSION: &str = "latest";

/// Unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of this process as published to the registry.
///
/// Built once at startup and never mutated afterwards; every registration,
/// refresh and deregistration for the process uses the same descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Registered service name.
    pub name: String,
    /// Service version.
    pub version: String,
    /// Per-process node identity.
    pub node_id: NodeId,
    /// `host:port` clients should connect to.
    pub advertised_address: String,
}

impl ServiceDescriptor {
    /// Create a descriptor with a fresh node id.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        advertised_address: impl Into<String>,
    ) -> Self {
        Self::with_node_id(name, version, advertised_address, NodeId::new())
    }

    /// Create a descriptor with an explicit node id.
    pub fn with_node_id(
        name: impl Into<String>,
        version: impl Into<String>,
        advertised_address: impl Into<String>,
        node_id: NodeId,
    ) -> Self {
        let version = version.into();
        Self {
            name: name.into(),
            version: if version.trim().is_empty() {
                DEFAULT_VERSION.to_string()
            } else {
                version
            },
            node_id,
            advertised_address: advertised_address.into(),
        }
    }

    /// Registry key for this node under `prefix`.
    pub fn registry_key(&self, prefix: &str) -> String {
        format!(
            "{}/{}/{}",
            prefix.trim_end_matches('/'),
            self.name,
            self.node_id
        )
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.name, self.advertised_address, self.node_id
        )
    }
}
