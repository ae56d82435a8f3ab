use anyhow::Result;
use clap::Parser;
use mfrec::{init_tracing, AppState, Config};
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single batch update and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = Config::load_or_default(&args.config)?;
    let interval = Duration::from_secs(config.worker.batch_interval_secs.max(1));
    info!("Starting mfrec batch update worker, interval {:?}", interval);

    let state = AppState::new(config).await?;

    if args.once {
        run_batch(&state).await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => run_batch(&state).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping worker");
                break;
            }
        }
    }

    Ok(())
}

async fn run_batch(state: &AppState) {
    match state.recommendation_service.batch_update().await {
        Ok(report) => info!(
            applied = report.applied,
            failed = report.failed,
            watermark = ?report.watermark,
            "Batch update applied"
        ),
        Err(e) if e.is_noop() => info!("{}", e),
        Err(e) => error!(error = %e, "Batch update failed"),
    }
}
