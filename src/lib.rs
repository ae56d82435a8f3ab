pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::MfModel;
pub use config::Config;
pub use error::{MfError, MfResult};
pub use models::*;

use anyhow::Result;
use services::recommendation::RecommendationService;
use services::training::TrainingService;
use services::{Persistence, SharedModel};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub model: SharedModel,
    pub persistence: Persistence,
    pub recommendation_service: Arc<RecommendationService>,
    pub training_service: Arc<TrainingService>,
}

impl AppState {
    /// Connects to Postgres and Redis, then restores the last snapshot.
    pub async fn new(config: Config) -> Result<Self> {
        let persistence = Persistence::connect(&config).await?;
        Ok(Self::with_persistence(config, persistence).await?)
    }

    pub async fn with_persistence(config: Config, persistence: Persistence) -> MfResult<Self> {
        let config = Arc::new(config);
        let model = services::empty_model();

        let recommendation_service = Arc::new(RecommendationService::new(
            model.clone(),
            persistence.clone(),
            config.serving.clone(),
        ));
        let training_service = Arc::new(TrainingService::new(
            model.clone(),
            persistence.clone(),
            &config.model,
        ));

        recommendation_service.restore().await?;

        Ok(Self {
            config,
            model,
            persistence,
            recommendation_service,
            training_service,
        })
    }
}

/// `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
