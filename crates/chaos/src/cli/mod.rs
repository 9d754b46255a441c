mod run;
mod version;

pub use run::RunCommand;
pub use version::VersionCommand;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// CHAOS - service lifecycle and registration runtime
#[derive(Parser)]
#[command(name = "chaos")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the service.
    Run(RunCommand),

    /// Print build information.
    Version(VersionCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Version(cmd) => cmd.execute(),
        }
    }
}
