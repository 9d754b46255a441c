use serde::Serialize;

use crate::config::ServiceConfig;

/// Build and deployment information reported by `/version` and `chaos version`.
///
/// Commit, build time and builder are stamped at compile time through the
/// `CHAOS_COMMIT`, `CHAOS_BUILD_TIME` and `CHAOS_BUILD_USER` environment
/// variables and are empty when unset.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub app_desc: String,
    pub version: String,
    pub env: String,
    pub commit: String,
    pub build_time: String,
    pub build_user: String,
    pub rust_version: String,
}

impl BuildInfo {
    /// Build information for the configured service.
    pub fn for_service(service: &ServiceConfig) -> Self {
        Self {
            app_desc: service.app_desc.clone(),
            version: service.version.clone(),
            env: service.env.as_str().to_string(),
            ..Self::compiled()
        }
    }

    /// Build information without any service configuration.
    pub fn compiled() -> Self {
        Self {
            app_desc: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            env: String::new(),
            commit: option_env!("CHAOS_COMMIT").unwrap_or_default().to_string(),
            build_time: option_env!("CHAOS_BUILD_TIME")
                .unwrap_or_default()
                .to_string(),
            build_user: option_env!("CHAOS_BUILD_USER")
                .unwrap_or_default()
                .to_string(),
            rust_version: option_env!("CHAOS_RUSTC_VERSION")
                .unwrap_or_default()
                .to_string(),
        }
    }
}
