use std::time::Duration;

use super::node::ServiceDescriptor;

/// State of this process's registration lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// No successful registration yet.
    Unregistered,
    /// Registered and within its TTL.
    Registered,
    /// A refresh call is in flight.
    Refreshing,
    /// Explicitly removed from the registry.
    Deregistered,
    /// Refreshes kept failing past the TTL; the registry has likely dropped us.
    Expired,
}

impl LeaseState {
    /// Convert to string for logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Refreshing => "refreshing",
            Self::Deregistered => "deregistered",
            Self::Expired => "expired",
        }
    }

    /// Whether a lease in this state must be stopped before starting another.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Registered | Self::Refreshing | Self::Expired)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the lease held by a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// What is registered.
    pub descriptor: ServiceDescriptor,
    /// Registry-side time-to-live.
    pub ttl: Duration,
    /// Refresh period; zero for a static registration.
    pub refresh_interval: Duration,
    /// Current state.
    pub state: LeaseState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(!LeaseState::Unregistered.is_active());
        assert!(LeaseState::Registered.is_active());
        assert!(LeaseState::Refreshing.is_active());
        assert!(LeaseState::Expired.is_active());
        assert!(!LeaseState::Deregistered.is_active());
    }
}
