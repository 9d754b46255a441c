/// Process lifecycle state.
///
/// Transitions only move forward:
/// `NotStarted -> Starting -> Running -> ShuttingDown -> Stopped`.
/// A failed startup skips `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    /// Convert to string for logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    /// Whether shutdown has begun or finished.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the process is shutting down. Recorded by the first trigger only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// An OS termination signal, by name.
    Signal(&'static str),
    /// An explicit stop request.
    Stop,
    /// The listener failed to bind or its serve loop died.
    ListenerFailed(String),
    /// Initial registration failed while discovery is configured.
    RegistrationFailed(String),
    /// The refresh failure policy escalated.
    HeartbeatFailed(String),
}

impl TerminationReason {
    /// Whether this reason represents a failure rather than a requested stop.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ListenerFailed(_) | Self::RegistrationFailed(_) | Self::HeartbeatFailed(_)
        )
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {}", name),
            Self::Stop => f.write_str("stop requested"),
            Self::ListenerFailed(e) => write!(f, "listener failed: {}", e),
            Self::RegistrationFailed(e) => write!(f, "registration failed: {}", e),
            Self::HeartbeatFailed(e) => write!(f, "heartbeat failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        use LifecycleState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(ShuttingDown));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Starting));
        assert!(!ShuttingDown.can_transition_to(ShuttingDown));
        assert!(!Stopped.can_transition_to(NotStarted));
        assert!(!NotStarted.can_transition_to(Running));
    }

    #[test]
    fn test_failure_reasons() {
        assert!(!TerminationReason::Signal("SIGTERM").is_failure());
        assert!(!TerminationReason::Stop.is_failure());
        assert!(TerminationReason::ListenerFailed("bind".into()).is_failure());
        assert!(TerminationReason::RegistrationFailed("etcd down".into()).is_failure());
    }
}
