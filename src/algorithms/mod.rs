pub mod factor_store;
pub mod identity;
pub mod incremental;
pub mod initializer;
pub mod optimizer;
pub mod ranker;
pub mod trainer;

pub use factor_store::{FactorStore, Hyperparameters};
pub use identity::IdentityIndex;
pub use trainer::BatchTrainer;

use crate::error::{MfError, MfResult};
use crate::models::*;
use crate::utils::validation::validate_snapshot;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

pub const SNAPSHOT_VERSION: &str = "mfrec-snapshot-v1";

/// The whole model: factor store plus the identity index addressing it.
///
/// Row `k` of the user (item) factors belongs to the external id bound to
/// user (item) index `k`; both sides always have the same cardinality.
#[derive(Debug, Clone)]
pub struct MfModel {
    store: FactorStore,
    identity: IdentityIndex,
}

impl MfModel {
    pub fn from_parts(store: FactorStore, identity: IdentityIndex) -> MfResult<Self> {
        for kind in [EntityKind::User, EntityKind::Item] {
            if store.len(kind) != identity.len(kind) {
                return Err(MfError::invalid(format!(
                    "{} cardinality mismatch: {} rows, {} ids",
                    kind,
                    store.len(kind),
                    identity.len(kind)
                )));
            }
        }
        Ok(Self { store, identity })
    }

    pub fn store(&self) -> &FactorStore {
        &self.store
    }

    pub fn identity(&self) -> &IdentityIndex {
        &self.identity
    }

    pub fn n_users(&self) -> usize {
        self.store.n_users()
    }

    pub fn n_items(&self) -> usize {
        self.store.n_items()
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.store.last_update_time()
    }

    /// Binds `external_id` if unseen and grows the matching factor rows in the same step.
    fn resolve_or_grow(&mut self, kind: EntityKind, external_id: &str) -> (usize, bool) {
        let (index, created) = self.identity.resolve_or_create(kind, external_id);
        if created {
            let row = self.store.grow(kind);
            debug_assert_eq!(row, index);
        }
        (index, created)
    }

    pub fn predict(&self, user_id: &str, item_id: &str) -> MfResult<f64> {
        let u = self
            .identity
            .lookup(EntityKind::User, user_id)
            .ok_or_else(|| MfError::UnknownUser(user_id.to_string()))?;
        let i = self
            .identity
            .lookup(EntityKind::Item, item_id)
            .ok_or_else(|| MfError::UnknownItem(item_id.to_string()))?;
        self.store.predict(u, i)
    }

    /// Ranks every item the user may still see. Never allocates identities.
    pub fn recommend(
        &self,
        user_id: &str,
        top_k: usize,
        excluded: &[String],
    ) -> MfResult<Vec<RecommendedItem>> {
        if top_k == 0 {
            return Err(MfError::invalid("top_k must be greater than 0"));
        }
        let u = self
            .identity
            .lookup(EntityKind::User, user_id)
            .ok_or_else(|| MfError::UnknownUser(user_id.to_string()))?;
        self.store.check_user(u)?;

        let excluded: HashSet<usize> = excluded
            .iter()
            .filter_map(|item_id| self.identity.lookup(EntityKind::Item, item_id))
            .collect();

        ranker::score_candidates(&self.store, u, &excluded, top_k)
            .into_iter()
            .map(|(i, score)| {
                let item_id = self
                    .identity
                    .reverse_lookup(EntityKind::Item, i)
                    .ok_or(MfError::IndexOutOfRange {
                        kind: EntityKind::Item,
                        index: i,
                        len: self.identity.len(EntityKind::Item),
                    })?;
                Ok(RecommendedItem {
                    item_id: item_id.to_string(),
                    score,
                })
            })
            .collect()
    }

    pub fn to_snapshot(&self) -> ModelSnapshot {
        let hyper = self.store.hyperparameters();
        let rows = |rows: &[nalgebra::DVector<f64>]| -> Vec<Vec<f64>> {
            rows.iter().map(|row| row.as_slice().to_vec()).collect()
        };

        ModelSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            saved_at: Utc::now(),
            n_users: self.store.n_users(),
            n_items: self.store.n_items(),
            n_factors: hyper.n_factors,
            lr: hyper.learning_rate,
            reg: hyper.regularization,
            init_std_dev: hyper.init_std_dev,
            seed: hyper.seed,
            mu: self.store.mu(),
            p: rows(self.store.user_rows()),
            q: rows(self.store.item_rows()),
            bu: self.store.user_biases().to_vec(),
            bi: self.store.item_biases().to_vec(),
            last_update_time: self.store.last_update_time(),
            users: self.identity.ids(EntityKind::User).to_vec(),
            items: self.identity.ids(EntityKind::Item).to_vec(),
        }
    }

    pub fn from_snapshot(snapshot: ModelSnapshot) -> MfResult<Self> {
        validate_snapshot(&snapshot)?;

        let hyper = Hyperparameters {
            n_factors: snapshot.n_factors,
            learning_rate: snapshot.lr,
            regularization: snapshot.reg,
            init_std_dev: snapshot.init_std_dev,
            seed: snapshot.seed,
        };
        let identity = IdentityIndex::from_ordered(snapshot.users, snapshot.items)
            .ok_or_else(|| MfError::CorruptSnapshot("duplicate external id".to_string()))?;
        let store = FactorStore::from_parts(
            hyper,
            snapshot.mu,
            snapshot.p,
            snapshot.q,
            snapshot.bu,
            snapshot.bi,
            snapshot.last_update_time,
        )
        .map_err(|e| MfError::CorruptSnapshot(e.to_string()))?;

        Self::from_parts(store, identity).map_err(|e| MfError::CorruptSnapshot(e.to_string()))
    }
}
