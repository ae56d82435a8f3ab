use crate::algorithms::{BatchTrainer, Hyperparameters};
use crate::config::ModelConfig;
use crate::error::MfResult;
use crate::models::FitReport;
use crate::services::{LiveModel, Persistence, SharedModel};
use std::time::Instant;
use tracing::{info, warn};

/// Cold-start training from the full rating log.
pub struct TrainingService {
    model: SharedModel,
    persistence: Persistence,
    trainer: BatchTrainer,
    hyper: Hyperparameters,
}

impl TrainingService {
    pub fn new(model: SharedModel, persistence: Persistence, config: &ModelConfig) -> Self {
        Self {
            model,
            persistence,
            trainer: BatchTrainer::new(config.epochs, config.seed),
            hyper: config.hyperparameters(),
        }
    }

    /// Refits from scratch and replaces the snapshot, the live model and the
    /// identity mirror, in that order. Holds the write lock throughout, so it
    /// is safe to rerun after a crash. A failed mirror write is logged and
    /// leaves the mirror marked degraded.
    pub async fn fit(&self) -> MfResult<FitReport> {
        let start = Instant::now();
        let mut guard = self.model.write().await;

        let events = self.persistence.fetch_all().await?;
        info!(n_events = events.len(), "Fetched rating log for training");

        let (model, report) = self.trainer.fit_events(&events, self.hyper)?;
        let stamp = self.persistence.save_snapshot(&model).await?;
        if let Err(e) = self.persistence.replace_bindings(&model).await {
            warn!(error = %e, "Identity mirror replace failed, marked degraded");
        }
        *guard = Some(LiveModel::new(model, Some(stamp)));

        info!(
            n_ratings = report.n_ratings,
            rmse = report.rmse,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Training complete"
        );
        Ok(report)
    }
}
