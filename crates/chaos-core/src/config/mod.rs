mod address;
mod discovery;
mod observability;

pub use address::resolve_advertised_address;
pub use discovery::DiscoveryConfig;
pub use observability::{LoggingConfig, ObservabilityConfig};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ChaosError, Result};

/// Root configuration for a CHAOS service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Service identity and bind address.
    pub service: ServiceConfig,

    /// Registry settings. Absent means discovery is disabled.
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,

    /// Startup/shutdown timing.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ChaosConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ChaosError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        let config: ChaosConfig = toml::from_str(&content)
            .map_err(|e| ChaosError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a named service with discovery disabled.
    pub fn default_for_service(name: &str) -> Self {
        Self {
            service: ServiceConfig {
                name: name.to_string(),
                ..Default::default()
            },
            discovery: None,
            lifecycle: LifecycleConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// Discovery settings, if discovery is actually enabled.
    pub fn active_discovery(&self) -> Option<&DiscoveryConfig> {
        self.discovery.as_ref().filter(|d| d.is_enabled())
    }

    /// Validate all sections, returning the first failure.
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        if let Some(discovery) = self.active_discovery() {
            discovery.validate()?;
        }
        self.lifecycle.validate()?;
        Ok(())
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Test,
    Pre,
    #[default]
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Pre => "pre",
            Self::Prod => "prod",
        }
    }
}

/// Service identity and listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name as registered.
    pub name: String,

    /// Service version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Deployment environment.
    #[serde(default)]
    pub env: Environment,

    /// Address to bind the listener to.
    #[serde(default = "default_address")]
    pub address: String,

    /// Address to publish instead of the bound one.
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Human-readable description returned by `/version`.
    #[serde(default)]
    pub app_desc: String,

    /// Log method, path, status and latency of every request.
    #[serde(default)]
    pub log_request_time: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: default_version(),
            env: Environment::default(),
            address: default_address(),
            advertise_address: None,
            app_desc: String::new(),
            log_request_time: false,
        }
    }
}

impl ServiceConfig {
    /// Name published to the registry; non-production environments get a suffix.
    pub fn registered_name(&self) -> String {
        match self.env {
            Environment::Prod => self.name.clone(),
            env => format!("{}.{}", self.name, env.as_str()),
        }
    }

    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.address.parse().map_err(|e| {
            ChaosError::Config(format!("Invalid service address '{}': {}", self.address, e))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ChaosError::Config(
                "service.name is required and must not be empty".to_string(),
            ));
        }
        self.bind_addr()?;
        if let Some(addr) = &self.advertise_address {
            if addr.rsplit_once(':').is_none() {
                return Err(ChaosError::Config(format!(
                    "service.advertise_address '{}' must be host:port",
                    addr
                )));
            }
        }
        Ok(())
    }
}

fn default_version() -> String {
    crate::discovery::DEFAULT_VERSION.to_string()
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Startup and shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long the listener may drain in-flight requests, in seconds.
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_deadline_secs: default_shutdown_deadline(),
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.shutdown_deadline_secs == 0 {
            return Err(ChaosError::Config(
                "lifecycle.shutdown_deadline_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_shutdown_deadline() -> u64 {
    5
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
