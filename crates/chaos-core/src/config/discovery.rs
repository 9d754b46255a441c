use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChaosError, Result};

/// Service registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Registry endpoints, tried in order. Empty disables discovery.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Key prefix under which nodes are published.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lease time-to-live in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Seconds between refreshes. Zero registers once and never refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Upper bound on each registry call, in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Consecutive refresh failures that trigger shutdown. Unset retries forever.
    #[serde(default)]
    pub max_refresh_failures: Option<u32>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl(),
            refresh_interval_secs: default_refresh_interval(),
            call_timeout_ms: default_call_timeout(),
            max_refresh_failures: None,
        }
    }
}

impl DiscoveryConfig {
    /// Discovery is on only when at least one endpoint is configured.
    pub fn is_enabled(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(ChaosError::Config(
                "discovery.ttl_secs must be > 0".to_string(),
            ));
        }
        if self.refresh_interval_secs > 0 && self.refresh_interval_secs >= self.ttl_secs {
            return Err(ChaosError::Config(format!(
                "discovery.refresh_interval_secs ({}) must be shorter than ttl_secs ({})",
                self.refresh_interval_secs, self.ttl_secs
            )));
        }
        if self.call_timeout_ms == 0 {
            return Err(ChaosError::Config(
                "discovery.call_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_refresh_failures == Some(0) {
            return Err(ChaosError::Config(
                "discovery.max_refresh_failures must be > 0 when set".to_string(),
            ));
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(ChaosError::Config(
                "discovery.endpoints must not contain empty entries".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_key_prefix() -> String {
    "/chaos/registry".to_string()
}

fn default_ttl() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    15
}

fn default_call_timeout() -> u64 {
    3000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> DiscoveryConfig {
        DiscoveryConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert!(!config.is_enabled());
        assert_eq!(config.ttl(), Duration::from_secs(30));
        assert_eq!(config.refresh_interval(), Duration::from_secs(15));
        assert_eq!(config.call_timeout(), Duration::from_secs(3));
        assert!(enabled().validate().is_ok());
    }

    #[test]
    fn test_refresh_must_be_shorter_than_ttl() {
        let mut config = enabled();
        config.refresh_interval_secs = 30;
        assert!(config.validate().is_err());

        config.refresh_interval_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = enabled();
        config.ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = enabled();
        config.call_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = enabled();
        config.max_refresh_failures = Some(0);
        assert!(config.validate().is_err());
    }
}
