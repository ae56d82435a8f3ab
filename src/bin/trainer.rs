use anyhow::Result;
use clap::Parser;
use mfrec::services::training::TrainingService;
use mfrec::services::{empty_model, Persistence};
use mfrec::{init_tracing, Config};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("Starting mfrec trainer");

    let config = Config::load_or_default(&args.config)?;
    info!("Model configuration: {:?}", config.model);

    // cold fit ignores any existing snapshot
    let persistence = Persistence::connect(&config).await?;
    let service = TrainingService::new(empty_model(), persistence, &config.model);
    let report = service.fit().await?;

    info!(
        n_ratings = report.n_ratings,
        n_users = report.n_users,
        n_items = report.n_items,
        epochs = report.epochs,
        mu = report.mu,
        rmse = report.rmse,
        watermark = ?report.watermark,
        snapshot = %config.snapshot.path.display(),
        "Cold fit finished"
    );

    Ok(())
}
