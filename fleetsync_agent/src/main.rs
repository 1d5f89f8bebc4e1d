use clap::Parser;
use fleetsync_agent::cli::{Cli, Commands};
use fleetsync_core::AgentConfig;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleetsync_core::o11y::init_from_env()?;
    let cli = Cli::parse();

    let cfg = AgentConfig::from_env()?;
    let mut engine = fleetsync_agent::bootstrap::build_engine(&cfg).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("interrupt received, finishing current cycle");
                        signal.cancel();
                    }
                    Err(e) => tracing::error!(error = %e, "ctrl-c handler failed"),
                }
            });
            engine.run_loop(shutdown).await?;
        }
        Commands::Once => {
            let report = engine.run_cycle().await?;
            tracing::info!(?report, "single cycle finished");
        }
    }
    tracing::info!("agent stopped");
    Ok(())
}
