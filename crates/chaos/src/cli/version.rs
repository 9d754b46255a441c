use anyhow::Result;
use chaos_core::config::ChaosConfig;
use chaos_core::BuildInfo;
use clap::Parser;
use serde_json::json;

/// Print build information as JSON.
#[derive(Parser)]
pub struct VersionCommand {
    /// Configuration file to read service metadata from, when present.
    #[arg(short, long, default_value = "chaos.toml")]
    pub config: String,
}

impl VersionCommand {
    pub fn execute(self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(&self.report())?);
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        let info = match ChaosConfig::from_file(&self.config) {
            Ok(config) => BuildInfo::for_service(&config.service),
            Err(_) => BuildInfo::compiled(),
        };
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        json!({
            "ret": 0,
            "msg": "OK",
            "data": info,
            "hostname": host,
        })
    }
}
