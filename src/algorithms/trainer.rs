use super::factor_store::{FactorStore, Hyperparameters};
use super::identity::IdentityIndex;
use super::MfModel;
use crate::error::{MfError, MfResult};
use crate::models::{EntityKind, FitReport, RatingEvent, RatingTriple};
use crate::utils::metrics;
use crate::utils::validation::validate_rating_event;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

/// Cold-start trainer: multi-epoch SGD over the full rating set.
#[derive(Debug, Clone, Copy)]
pub struct BatchTrainer {
    epochs: usize,
    seed: u64,
}

impl BatchTrainer {
    pub fn new(epochs: usize, seed: u64) -> Self {
        Self { epochs, seed }
    }

    /// Fits `store` in place and returns the training RMSE after the last epoch.
    ///
    /// `mu` is set once from the input; every epoch visits the ratings in a
    /// fresh random order. The watermark is set only after all epochs finish.
    pub fn fit(
        &self,
        store: &mut FactorStore,
        ratings: &[RatingTriple],
        watermark: Option<DateTime<Utc>>,
    ) -> MfResult<f64> {
        if ratings.is_empty() {
            return Err(MfError::invalid("cannot fit on an empty rating set"));
        }
        if store.n_users() == 0 || store.n_items() == 0 {
            return Err(MfError::invalid(format!(
                "fit needs at least one user and one item (got {} users, {} items)",
                store.n_users(),
                store.n_items()
            )));
        }
        for triple in ratings {
            store.check_user(triple.user_idx)?;
            store.check_item(triple.item_idx)?;
            if !triple.rating.is_finite() {
                return Err(MfError::invalid(format!(
                    "rating must be finite, got {}",
                    triple.rating
                )));
            }
        }

        let mu = ratings.iter().map(|t| t.rating).sum::<f64>() / ratings.len() as f64;
        store.set_mu(mu);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut order: Vec<RatingTriple> = ratings.to_vec();

        for epoch in 0..self.epochs {
            order.shuffle(&mut rng);
            for triple in &order {
                store.sgd_step(triple.user_idx, triple.item_idx, triple.rating)?;
            }
            debug!(
                epoch = epoch + 1,
                rmse = metrics::rmse(store, ratings),
                "Completed training epoch"
            );
        }

        let rmse = metrics::rmse(store, ratings);
        if !rmse.is_finite() {
            return Err(MfError::Diverged(format!(
                "training RMSE is {} after {} epochs",
                rmse, self.epochs
            )));
        }

        store.set_last_update_time(watermark);
        Ok(rmse)
    }

    /// Builds a fresh model from raw log events.
    ///
    /// Ids are bound in log order; the watermark becomes the newest `created_at`.
    pub fn fit_events(
        &self,
        events: &[RatingEvent],
        hyper: Hyperparameters,
    ) -> MfResult<(MfModel, FitReport)> {
        if events.is_empty() {
            return Err(MfError::invalid("no ratings found in the rating log"));
        }
        for event in events {
            validate_rating_event(event)?;
        }

        let mut identity = IdentityIndex::new();
        let triples: Vec<RatingTriple> = events
            .iter()
            .map(|event| {
                let (user_idx, _) = identity.resolve_or_create(EntityKind::User, &event.user_id);
                let (item_idx, _) = identity.resolve_or_create(EntityKind::Item, &event.item_id);
                RatingTriple::new(user_idx, item_idx, event.rating)
            })
            .collect();
        let watermark = events.iter().map(|event| event.created_at).max();

        let n_users = identity.len(EntityKind::User);
        let n_items = identity.len(EntityKind::Item);
        let mut store = FactorStore::new(n_users, n_items, hyper)?;
        let rmse = self.fit(&mut store, &triples, watermark)?;

        let report = FitReport {
            n_ratings: triples.len(),
            n_users,
            n_items,
            epochs: self.epochs,
            mu: store.mu(),
            rmse,
            watermark,
        };
        info!(
            n_ratings = report.n_ratings,
            n_users, n_items,
            rmse,
            "Model trained"
        );

        Ok((MfModel::from_parts(store, identity)?, report))
    }
}
