use anyhow::{Context, Result};
use chaos::Chaos;
use chaos_core::config::{ChaosConfig, LoggingConfig};
use clap::Parser;
use console::style;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run the service.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "chaos.toml")]
    pub config: String,

    /// Port to listen on (overrides config).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable development mode (verbose logging).
    #[arg(long)]
    pub dev: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        let config_path = std::path::Path::new(&self.config);
        if !config_path.exists() {
            anyhow::bail!("Configuration file not found: {}", self.config);
        }

        let config = self.load_config()?;
        init_tracing(&config.observability.logging, self.dev);

        println!();
        println!(
            "  {}  {} v{}",
            style("◆").bold(),
            style(&config.service.name).bold().cyan(),
            config.service.version
        );
        println!(
            "  {} Listening on {}",
            style("→").bold(),
            style(format!("http://{}", config.service.address)).cyan()
        );
        match config.active_discovery() {
            Some(discovery) => println!(
                "  {} Registering with {}",
                style("→").bold(),
                style(discovery.endpoints.join(", ")).cyan()
            ),
            None => println!("  {} Discovery disabled", style("→").bold()),
        }
        if self.dev {
            println!("  {} Development mode enabled", style("→").bold());
        }
        println!();

        info!(config = %self.config, "Starting service");

        let chaos = Chaos::builder().config(config).build()?;
        let reason = chaos.run().await?;

        if reason.is_failure() {
            anyhow::bail!("Service stopped: {}", reason);
        }

        println!("\n  {} Stopped ({})", style("◆").bold(), reason);
        Ok(())
    }

    fn load_config(&self) -> Result<ChaosConfig> {
        let mut config = ChaosConfig::from_file(&self.config)
            .with_context(|| format!("Failed to load {}", self.config))?;

        if let Some(port) = self.port {
            let mut addr = config.service.bind_addr()?;
            addr.set_port(port);
            config.service.address = addr.to_string();
        }
        Ok(config)
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level; `dev` forces debug.
fn init_tracing(logging: &LoggingConfig, dev: bool) {
    let level = if dev { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if logging.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_run_command_defaults() {
        let cmd = RunCommand {
            config: "chaos.toml".to_string(),
            port: None,
            dev: false,
        };
        assert_eq!(cmd.config, "chaos.toml");
        assert!(!cmd.dev);
    }

    #[test]
    fn test_port_override() {
        let file = write_config(
            r#"
            [service]
            name = "orders"
            address = "0.0.0.0:8080"
            "#,
        );
        let cmd = RunCommand {
            config: file.path().to_string_lossy().to_string(),
            port: Some(9100),
            dev: false,
        };

        let config = cmd.load_config().unwrap();
        assert_eq!(config.service.address, "0.0.0.0:9100");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let file = write_config("[service]\nname = \"\"\n");
        let cmd = RunCommand {
            config: file.path().to_string_lossy().to_string(),
            port: None,
            dev: false,
        };
        let err = cmd.load_config().unwrap_err();
        assert!(err.to_string().contains("Failed to load"));
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let cmd = RunCommand {
            config: "/nonexistent/chaos.toml".to_string(),
            port: None,
            dev: false,
        };
        assert!(cmd.execute().await.is_err());
    }
}
