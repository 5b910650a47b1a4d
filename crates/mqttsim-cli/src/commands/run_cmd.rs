use anyhow::{Context, Result};
use clap::Args;
use mqtt_device_sim::{Orchestrator, SimulationConfig, StopReason};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Args)]
pub struct RunCommand {
    /// Path to the JSON configuration document
    #[arg(long, short, env = "MQTTSIM_CONFIG")]
    pub config: PathBuf,

    /// Master seed for reproducible values (random when omitted)
    #[arg(long, short)]
    pub seed: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long, short, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Client ID (overrides the configuration file)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Seconds to wait for devices to finish on shutdown
    #[arg(long, default_value = "10", value_parser = parse_duration)]
    pub stop_timeout: Duration,

    /// Print the session report as JSON when the run ends
    #[arg(long)]
    pub json: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("expected a number of seconds, got: {s}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {s}: {e}"))
}

pub async fn execute(cmd: RunCommand) -> Result<()> {
    let mut config = SimulationConfig::from_path(&cmd.config)
        .with_context(|| format!("Invalid configuration: {}", cmd.config.display()))?;
    if let Some(client_id) = cmd.client_id {
        config.connection = config.connection.with_client_id(client_id);
    }
    debug!(
        broker = %config.connection.broker_address(),
        devices = config.registry.len(),
        "Loaded configuration"
    );

    let mut orchestrator = Orchestrator::new(config.registry, config.connection)
        .with_stop_timeout(cmd.stop_timeout);
    if let Some(seed) = cmd.seed {
        orchestrator = orchestrator.with_seed(seed);
    }

    let session = orchestrator
        .start()
        .await
        .context("Broker unreachable")?;
    info!(devices = session.device_count(), "Simulation running");
    if cmd.duration.is_none() {
        println!("✓ Simulating {} devices, press Ctrl+C to stop", session.device_count());
    }

    let report = session.run_until_shutdown(cmd.duration).await;

    if cmd.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to render report")?
        );
    } else {
        println!(
            "✓ Stopped after {:.1}s: {} published, {} failed",
            report.elapsed.as_secs_f64(),
            report.total_published(),
            report.total_failed()
        );
    }

    if report.reason == StopReason::ConnectionFailed {
        let failure = report
            .failure
            .map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        anyhow::bail!("Broker connection lost: {failure}");
    }
    Ok(())
}
