use super::initializer::RowInitializer;
use super::optimizer::RegularizedSgd;
use crate::error::{MfError, MfResult};
use crate::models::EntityKind;
use chrono::{DateTime, Utc};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub n_factors: usize,
    pub learning_rate: f64,
    pub regularization: f64,
    pub init_std_dev: f64,
    pub seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            n_factors: 20,
            learning_rate: 0.01,
            regularization: 0.01,
            init_std_dev: 0.1,
            seed: 42,
        }
    }
}

impl Hyperparameters {
    pub fn initializer(&self) -> RowInitializer {
        RowInitializer::new(self.init_std_dev, self.seed)
    }

    pub fn optimizer(&self) -> RegularizedSgd {
        RegularizedSgd::new(self.learning_rate, self.regularization)
    }

    pub fn validate(&self) -> MfResult<()> {
        if self.n_factors == 0 {
            return Err(MfError::invalid("n_factors must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MfError::invalid("learning rate must be a positive finite number"));
        }
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return Err(MfError::invalid("regularization must be a non-negative finite number"));
        }
        if !(self.init_std_dev.is_finite() && self.init_std_dev >= 0.0) {
            return Err(MfError::invalid("init_std_dev must be a non-negative finite number"));
        }
        Ok(())
    }
}

/// True when `candidate` should move the watermark forward. An unset watermark
/// is older than any timestamp.
pub fn advances_watermark(candidate: DateTime<Utc>, watermark: Option<DateTime<Utc>>) -> bool {
    match watermark {
        None => true,
        Some(current) => candidate > current,
    }
}

/// Latent factors, biases and global mean of the model.
///
/// Rows live in growable vectors so that appending a user or item is amortized
/// O(1) and existing indices stay valid. `p.len() == bu.len()` and
/// `q.len() == bi.len()` hold after every public method returns.
#[derive(Debug, Clone)]
pub struct FactorStore {
    p: Vec<DVector<f64>>,
    q: Vec<DVector<f64>>,
    bu: Vec<f64>,
    bi: Vec<f64>,
    mu: f64,
    hyper: Hyperparameters,
    last_update_time: Option<DateTime<Utc>>,
}

impl FactorStore {
    pub fn new(n_users: usize, n_items: usize, hyper: Hyperparameters) -> MfResult<Self> {
        hyper.validate()?;
        let init = hyper.initializer();
        Ok(Self {
            p: init.rows(EntityKind::User, n_users, hyper.n_factors),
            q: init.rows(EntityKind::Item, n_items, hyper.n_factors),
            bu: vec![0.0; n_users],
            bi: vec![0.0; n_items],
            mu: 0.0,
            hyper,
            last_update_time: None,
        })
    }

    /// Rebuilds a store from raw parameters, checking every dimension invariant.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        hyper: Hyperparameters,
        mu: f64,
        p: Vec<Vec<f64>>,
        q: Vec<Vec<f64>>,
        bu: Vec<f64>,
        bi: Vec<f64>,
        last_update_time: Option<DateTime<Utc>>,
    ) -> MfResult<Self> {
        hyper.validate()?;
        if p.len() != bu.len() {
            return Err(MfError::invalid(format!(
                "user factor rows ({}) do not match user biases ({})",
                p.len(),
                bu.len()
            )));
        }
        if q.len() != bi.len() {
            return Err(MfError::invalid(format!(
                "item factor rows ({}) do not match item biases ({})",
                q.len(),
                bi.len()
            )));
        }
        if let Some(row) = p.iter().chain(q.iter()).find(|row| row.len() != hyper.n_factors) {
            return Err(MfError::invalid(format!(
                "factor row has {} columns, expected {}",
                row.len(),
                hyper.n_factors
            )));
        }

        Ok(Self {
            p: p.into_iter().map(DVector::from_vec).collect(),
            q: q.into_iter().map(DVector::from_vec).collect(),
            bu,
            bi,
            mu,
            hyper,
            last_update_time,
        })
    }

    pub fn n_users(&self) -> usize {
        self.p.len()
    }

    pub fn n_items(&self) -> usize {
        self.q.len()
    }

    pub fn n_factors(&self) -> usize {
        self.hyper.n_factors
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    pub(crate) fn set_mu(&mut self, mu: f64) {
        self.mu = mu;
    }

    pub fn user_biases(&self) -> &[f64] {
        &self.bu
    }

    pub fn item_biases(&self) -> &[f64] {
        &self.bi
    }

    pub fn user_factors(&self, u: usize) -> Option<&DVector<f64>> {
        self.p.get(u)
    }

    pub fn item_factors(&self, i: usize) -> Option<&DVector<f64>> {
        self.q.get(i)
    }

    pub fn user_rows(&self) -> &[DVector<f64>] {
        &self.p
    }

    pub fn item_rows(&self) -> &[DVector<f64>] {
        &self.q
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.last_update_time
    }

    pub(crate) fn set_last_update_time(&mut self, watermark: Option<DateTime<Utc>>) {
        self.last_update_time = watermark;
    }

    /// Moves the watermark forward if `event_time` is newer. Returns whether it moved.
    pub fn advance_watermark(&mut self, event_time: DateTime<Utc>) -> bool {
        if advances_watermark(event_time, self.last_update_time) {
            self.last_update_time = Some(event_time);
            true
        } else {
            false
        }
    }

    pub fn check_user(&self, u: usize) -> MfResult<()> {
        if u < self.p.len() {
            Ok(())
        } else {
            Err(MfError::IndexOutOfRange {
                kind: EntityKind::User,
                index: u,
                len: self.p.len(),
            })
        }
    }

    pub fn check_item(&self, i: usize) -> MfResult<()> {
        if i < self.q.len() {
            Ok(())
        } else {
            Err(MfError::IndexOutOfRange {
                kind: EntityKind::Item,
                index: i,
                len: self.q.len(),
            })
        }
    }

    pub fn predict(&self, u: usize, i: usize) -> MfResult<f64> {
        self.check_user(u)?;
        self.check_item(i)?;
        Ok(self.predict_unchecked(u, i))
    }

    /// Caller guarantees both indices are in bounds.
    pub(crate) fn predict_unchecked(&self, u: usize, i: usize) -> f64 {
        self.mu + self.bu[u] + self.bi[i] + self.p[u].dot(&self.q[i])
    }

    /// One stochastic gradient step on a single observed rating.
    ///
    /// Both latent deltas are taken from the rows as they were before the step.
    pub fn sgd_step(&mut self, u: usize, i: usize, rating: f64) -> MfResult<()> {
        self.check_user(u)?;
        self.check_item(i)?;
        if !rating.is_finite() {
            return Err(MfError::invalid(format!("rating must be finite, got {}", rating)));
        }

        let sgd = self.hyper.optimizer();
        let err = rating - self.predict_unchecked(u, i);

        let mut bu = self.bu[u];
        let mut bi = self.bi[i];
        sgd.step_scalar(&mut bu, err);
        sgd.step_scalar(&mut bi, err);
        let p = &self.p[u] + sgd.delta(&self.p[u], &(&self.q[i] * err));
        let q = &self.q[i] + sgd.delta(&self.q[i], &(&self.p[u] * err));

        // nothing is committed unless every new value is finite
        if !(bu.is_finite() && bi.is_finite() && p.iter().chain(q.iter()).all(|v| v.is_finite())) {
            return Err(MfError::Diverged(format!(
                "sgd step on user {} item {} produced non-finite parameters (error {})",
                u, i, err
            )));
        }

        self.bu[u] = bu;
        self.bi[i] = bi;
        self.p[u] = p;
        self.q[i] = q;
        Ok(())
    }

    /// Appends one user row and a zero bias. Returns the new dense index.
    pub fn grow_users(&mut self) -> usize {
        let index = self.p.len();
        let row = self
            .hyper
            .initializer()
            .row(EntityKind::User, index, self.hyper.n_factors);
        self.p.push(row);
        self.bu.push(0.0);
        index
    }

    /// Appends one item row and a zero bias. Returns the new dense index.
    pub fn grow_items(&mut self) -> usize {
        let index = self.q.len();
        let row = self
            .hyper
            .initializer()
            .row(EntityKind::Item, index, self.hyper.n_factors);
        self.q.push(row);
        self.bi.push(0.0);
        index
    }

    pub fn grow(&mut self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::User => self.grow_users(),
            EntityKind::Item => self.grow_items(),
        }
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::User => self.n_users(),
            EntityKind::Item => self.n_items(),
        }
    }
}
