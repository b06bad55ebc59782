// Runner agent binary
//
// Connects to the controller named by RUNNER_AGENT_CONTROLLER_URL and hosts
// backend sessions until interrupted.

use anyhow::{Context, Result};
use runner_agent::launcher::find_cli;
use runner_agent::{Runner, RunnerConfig, SyncChannel};
use tokio_util::sync::CancellationToken;

/// Backend CLIs probed for the register message
const KNOWN_CLIS: &[&str] = &["claude", "codex", "gemini"];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RunnerConfig::from_env().context("invalid runner configuration")?;
    log::info!("Starting runner {} v{}", config.runner_id, runner_agent::VERSION);
    log::debug!("{config:?}");

    let cli_types: Vec<String> = KNOWN_CLIS
        .iter()
        .filter(|cli| find_cli(cli).is_some())
        .map(ToString::to_string)
        .collect();
    if cli_types.is_empty() {
        log::warn!("No backend CLI found on this host");
    }

    let shutdown = CancellationToken::new();
    let (sync, transport_events, sync_task) =
        SyncChannel::spawn(config.sync_config(cli_types), shutdown.clone());
    let runner = Runner::new(config, sync);
    let runner_task = tokio::spawn(runner.run(transport_events, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    shutdown.cancel();

    runner_task.await.context("runner task panicked")??;
    sync_task.await.context("sync task panicked")?;
    Ok(())
}
