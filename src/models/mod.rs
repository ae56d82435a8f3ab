use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Item,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Item => "item",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only rating log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEvent {
    pub user_id: String,
    pub item_id: String,
    pub rating: f64,
    pub created_at: DateTime<Utc>,
}

/// A rating already resolved to dense indices, as consumed by the batch trainer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingTriple {
    pub user_idx: usize,
    pub item_idx: usize,
    pub rating: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub external_id: String,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub user_id: String,
    pub top_k: usize,
    pub exclude_items: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedItem {
    pub item_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub user_id: String,
    pub items: Vec<RecommendedItem>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateAck {
    pub user_id: String,
    pub item_id: String,
    pub outcome: RateOutcome,
    pub applied_online: bool,
}

/// What a single incremental update did to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub user_index: usize,
    pub item_index: usize,
    pub created_user: bool,
    pub created_item: bool,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchUpdateReport {
    pub applied: usize,
    pub failed: usize,
    pub new_users: usize,
    pub new_items: usize,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub n_ratings: usize,
    pub n_users: usize,
    pub n_items: usize,
    pub epochs: usize,
    pub mu: f64,
    pub rmse: f64,
    pub watermark: Option<DateTime<Utc>>,
}

/// Model shape plus serving counters, as reported by `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub model_loaded: bool,
    pub n_users: usize,
    pub n_items: usize,
    pub n_factors: usize,
    pub mu: f64,
    pub last_update_time: Option<DateTime<Utc>>,
    pub counters: HashMap<String, u64>,
}

/// Durable form of the whole model: factor store, identity index and watermark.
///
/// `users[k]` / `items[k]` are the external ids bound to dense index `k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub n_users: usize,
    pub n_items: usize,
    pub n_factors: usize,
    pub lr: f64,
    pub reg: f64,
    pub init_std_dev: f64,
    pub seed: u64,
    pub mu: f64,
    pub p: Vec<Vec<f64>>,
    pub q: Vec<Vec<f64>>,
    pub bu: Vec<f64>,
    pub bi: Vec<f64>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub users: Vec<String>,
    pub items: Vec<String>,
}

impl RatingEvent {
    pub fn new(
        user_id: impl Into<String>,
        item_id: impl Into<String>,
        rating: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            rating,
            created_at,
        }
    }
}

impl RatingTriple {
    pub fn new(user_idx: usize, item_idx: usize, rating: f64) -> Self {
        Self {
            user_idx,
            item_idx,
            rating,
        }
    }
}

impl RecommendationRequest {
    pub fn new(user_id: impl Into<String>, top_k: usize) -> Self {
        Self {
            user_id: user_id.into(),
            top_k,
            exclude_items: None,
        }
    }

    pub fn with_exclusions(mut self, items: Vec<String>) -> Self {
        self.exclude_items = Some(items);
        self
    }
}

impl RecommendationResponse {
    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.item_id.as_str()).collect()
    }
}

impl RateAck {
    pub fn new(event: RatingEvent, outcome: RateOutcome, applied_online: bool) -> Self {
        Self {
            user_id: event.user_id,
            item_id: event.item_id,
            outcome,
            applied_online,
        }
    }
}
