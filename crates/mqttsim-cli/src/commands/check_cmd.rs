use anyhow::{Context, Result};
use clap::Args;
use mqtt_device_sim::SimulationConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct CheckCommand {
    /// Path to the JSON configuration document
    #[arg(long, short, env = "MQTTSIM_CONFIG")]
    pub config: PathBuf,

    /// Only validate, do not print the resolved configuration
    #[arg(long, short)]
    pub quiet: bool,
}

/// Loads and validates the document, returning the resolved configuration
/// as pretty JSON
pub fn render(cmd: &CheckCommand) -> Result<String> {
    let config = SimulationConfig::from_path(&cmd.config)
        .with_context(|| format!("Invalid configuration: {}", cmd.config.display()))?;
    info!(
        devices = config.registry.len(),
        broker = %config.connection.broker_address(),
        "Configuration is valid"
    );
    serde_json::to_string_pretty(&config).context("Failed to render configuration")
}

pub fn execute(cmd: &CheckCommand) -> Result<()> {
    let rendered = render(cmd)?;
    if cmd.quiet {
        println!("✓ {} is valid", cmd.config.display());
    } else {
        println!("{rendered}");
    }
    Ok(())
}
