use crate::algorithms::MfModel;
use crate::config::{ReloadMode, ServingConfig};
use crate::error::{MfError, MfResult};
use crate::models::*;
use crate::services::{LiveModel, Persistence, SharedModel};
use crate::utils::validation::{validate_rating_event, validate_top_k};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Query and mutation surface over the shared model.
///
/// Reads take the model's read lock. Mutations take the write lock, work on
/// a copy, and swap it in only after the snapshot save succeeds. Every
/// operation first checks the snapshot stamp, so a model saved by another
/// process (the batch worker, the trainer) is picked up before it is read or
/// built upon.
pub struct RecommendationService {
    model: SharedModel,
    persistence: Persistence,
    serving: ServingConfig,
    serving_stats: Arc<DashMap<String, u64>>,
}

impl RecommendationService {
    pub fn new(model: SharedModel, persistence: Persistence, serving: ServingConfig) -> Self {
        Self {
            model,
            persistence,
            serving,
            serving_stats: Arc::new(DashMap::new()),
        }
    }

    /// Installs the persisted model, if any. Returns whether one was found.
    pub async fn restore(&self) -> MfResult<bool> {
        let Some(live) = self.persistence.load_live().await? else {
            warn!("No model snapshot found, serving is unavailable until a fit runs");
            return Ok(false);
        };

        if let Err(e) = self.persistence.repair_bindings(&live.model).await {
            warn!(error = %e, "Could not reconcile identity mirror with snapshot");
        }

        info!(
            n_users = live.model.n_users(),
            n_items = live.model.n_items(),
            watermark = ?live.model.last_update_time(),
            "Restored model from snapshot"
        );
        *self.model.write().await = Some(live);
        Ok(true)
    }

    /// Cheap check for readers: only takes the write lock when the saved
    /// snapshot differs from the live one.
    async fn refresh(&self) -> MfResult<()> {
        if self.serving.reload_mode == ReloadMode::Persistent {
            let stamp = self.persistence.snapshot_stamp().await?;
            let current = self.model.read().await.as_ref().map(|live| live.stamp.clone());
            if stamp.is_none() || current.as_ref() == Some(&stamp) {
                return Ok(());
            }
        }
        let mut guard = self.model.write().await;
        self.sync_locked(&mut guard).await
    }

    /// Reloads the snapshot into `slot` when it is stale. `PerRequest` always
    /// reloads. `Persistent` reloads when the saved stamp has moved.
    async fn sync_locked(&self, slot: &mut Option<LiveModel>) -> MfResult<()> {
        if self.serving.reload_mode == ReloadMode::PerRequest {
            *slot = self.persistence.load_live().await?;
            return Ok(());
        }

        let stamp = self.persistence.snapshot_stamp().await?;
        let current = slot.as_ref().map(|live| &live.stamp);
        if stamp.is_none() || current == Some(&stamp) {
            return Ok(());
        }

        if let Some(live) = self.persistence.load_live().await? {
            info!(
                stamp = ?live.stamp,
                n_users = live.model.n_users(),
                watermark = ?live.model.last_update_time(),
                "Reloaded snapshot saved by another writer"
            );
            self.increment_stat("snapshot_reloads");
            *slot = Some(live);
        }
        Ok(())
    }

    /// Saves `next` and then installs it. If the snapshot moved since `slot`
    /// was synced, nothing is saved, `slot` is reloaded and the caller gets
    /// `SnapshotConflict`. The identity mirror follows the save; a mirror
    /// failure is logged and left for the next write to repair.
    async fn commit_locked(&self, slot: &mut Option<LiveModel>, next: MfModel) -> MfResult<()> {
        let expected = slot.as_ref().and_then(|live| live.stamp.clone());
        let found = self.persistence.snapshot_stamp().await?;
        if found.is_some() && found != expected {
            *slot = self.persistence.load_live().await?;
            self.increment_stat("snapshot_conflicts");
            return Err(MfError::SnapshotConflict {
                expected: expected.map(|s| s.to_string()),
                found: found.map(|s| s.to_string()),
            });
        }

        let (users_before, items_before) = slot
            .as_ref()
            .map(|live| (live.model.n_users(), live.model.n_items()))
            .unwrap_or_default();
        let stamp = self.persistence.save_snapshot(&next).await?;

        if let Err(e) = self
            .persistence
            .publish_growth(&next, users_before, items_before)
            .await
        {
            warn!(error = %e, "Identity mirror write failed, marked degraded");
        }
        *slot = Some(LiveModel::new(next, Some(stamp)));
        Ok(())
    }

    async fn apply_locked(
        &self,
        slot: &mut Option<LiveModel>,
        user_id: &str,
        item_id: &str,
        rating: f64,
        event_time: Option<DateTime<Utc>>,
    ) -> MfResult<UpdateOutcome> {
        let mut next = slot.as_ref().ok_or(MfError::NotReady)?.model.clone();
        let outcome = next.update(user_id, item_id, rating, event_time)?;
        self.commit_locked(slot, next).await?;
        Ok(outcome)
    }

    pub async fn recommend(&self, request: &RecommendationRequest) -> MfResult<RecommendationResponse> {
        let start = Instant::now();
        self.increment_stat("total_requests");
        validate_top_k(request.top_k, self.serving.max_top_k)?;

        let mut excluded = request.exclude_items.clone().unwrap_or_default();
        if self.serving.exclude_rated {
            excluded.extend(self.persistence.rated_items(&request.user_id).await?);
        }

        self.refresh().await?;
        let items = {
            let guard = self.model.read().await;
            let live = guard.as_ref().ok_or(MfError::NotReady)?;
            match live.model.recommend(&request.user_id, request.top_k, &excluded) {
                Ok(items) => items,
                Err(e) => {
                    if matches!(e, MfError::UnknownUser(_)) {
                        self.increment_stat("unknown_user_requests");
                    }
                    return Err(e);
                }
            }
        };

        self.record_latency(start.elapsed().as_millis() as u64);
        self.increment_stat("successful_requests");
        debug!(
            user_id = %request.user_id,
            returned = items.len(),
            excluded = excluded.len(),
            "Served recommendations"
        );

        Ok(RecommendationResponse {
            user_id: request.user_id.clone(),
            items,
            generated_at: Utc::now(),
        })
    }

    pub async fn predict(&self, user_id: &str, item_id: &str) -> MfResult<f64> {
        self.refresh().await?;
        let guard = self.model.read().await;
        guard.as_ref().ok_or(MfError::NotReady)?.model.predict(user_id, item_id)
    }

    /// Appends the rating to the log. With `apply_on_rate` it is also applied
    /// to the live model right away, which moves the watermark past it.
    ///
    /// The write lock is held from before the append through the apply, so
    /// no batch in this process can replay the event in between. A batch in
    /// another process that absorbs it first shows up as a newer snapshot
    /// whose watermark covers the event, and the online apply is skipped.
    pub async fn rate(&self, event: RatingEvent) -> MfResult<RateAck> {
        validate_rating_event(&event)?;

        if !self.serving.apply_on_rate {
            let outcome = self.persistence.append(&event).await?;
            self.increment_stat("ratings_received");
            return Ok(RateAck::new(event, outcome, false));
        }

        let mut guard = self.model.write().await;
        self.sync_locked(&mut guard).await?;
        let before = guard.as_ref().map(|live| live.model.last_update_time());

        let outcome = self.persistence.append(&event).await?;
        self.increment_stat("ratings_received");

        self.sync_locked(&mut guard).await?;
        let after = guard.as_ref().map(|live| live.model.last_update_time());
        if let (Some(before), Some(after)) = (before, after) {
            let absorbed = before != after
                && is_covered(event.created_at, after)
                && !is_covered(event.created_at, before);
            if absorbed {
                debug!(user_id = %event.user_id, "Rating already replayed by another writer");
                return Ok(RateAck::new(event, outcome, true));
            }
        }

        let applied = self
            .apply_locked(
                &mut guard,
                &event.user_id,
                &event.item_id,
                event.rating,
                Some(event.created_at),
            )
            .await;
        let applied_online = match applied {
            Ok(_) => {
                self.increment_stat("online_updates");
                true
            }
            Err(MfError::NotReady) => {
                info!(user_id = %event.user_id, "Rating logged, no model loaded to apply it to");
                false
            }
            Err(e @ MfError::SnapshotConflict { .. }) => {
                warn!(error = %e, "Rating logged, online apply left to the next batch");
                false
            }
            Err(e) => return Err(e),
        };

        Ok(RateAck::new(event, outcome, applied_online))
    }

    /// One online update, persisted before it becomes visible.
    pub async fn update(
        &self,
        user_id: &str,
        item_id: &str,
        rating: f64,
        event_time: Option<DateTime<Utc>>,
    ) -> MfResult<UpdateOutcome> {
        let mut guard = self.model.write().await;
        self.sync_locked(&mut guard).await?;
        let outcome = self
            .apply_locked(&mut guard, user_id, item_id, rating, event_time)
            .await?;

        self.increment_stat("online_updates");
        Ok(outcome)
    }

    /// Applies every logged rating newer than the watermark.
    ///
    /// The write lock is held from the watermark read through the snapshot
    /// save, so concurrent mutations queue behind it.
    pub async fn batch_update(&self) -> MfResult<BatchUpdateReport> {
        let mut guard = self.model.write().await;
        self.sync_locked(&mut guard).await?;
        let live = guard.as_ref().ok_or(MfError::NotReady)?;

        let watermark = live.model.last_update_time();
        let events = self.persistence.fetch_since(watermark).await?;
        if events.is_empty() {
            self.increment_stat("batch_noops");
            info!(watermark = ?watermark, "No new ratings since last update");
            return Err(MfError::NoNewRatings { watermark });
        }

        let mut next = live.model.clone();
        let report = next.replay(&events)?;
        self.commit_locked(&mut guard, next).await?;

        self.increment_stat("batch_updates");
        info!(
            applied = report.applied,
            failed = report.failed,
            new_users = report.new_users,
            new_items = report.new_items,
            watermark = ?report.watermark,
            "Batch update complete"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> ServiceStats {
        let counters = self.get_serving_stats();
        let guard = self.model.read().await;
        match guard.as_ref().map(|live| &live.model) {
            Some(model) => ServiceStats {
                model_loaded: true,
                n_users: model.n_users(),
                n_items: model.n_items(),
                n_factors: model.store().n_factors(),
                mu: model.store().mu(),
                last_update_time: model.last_update_time(),
                counters,
            },
            None => ServiceStats {
                model_loaded: false,
                n_users: 0,
                n_items: 0,
                n_factors: 0,
                mu: 0.0,
                last_update_time: None,
                counters,
            },
        }
    }

    pub fn get_serving_stats(&self) -> HashMap<String, u64> {
        self.serving_stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn increment_stat(&self, key: &str) {
        let mut counter = self.serving_stats.entry(key.to_string()).or_insert(0);
        *counter += 1;
    }

    fn record_latency(&self, latency_ms: u64) {
        let mut max = self
            .serving_stats
            .entry("max_latency_ms".to_string())
            .or_insert(0);
        if latency_ms > *max {
            *max = latency_ms;
        }
    }
}

/// Whether a watermark already accounts for an event at `created_at`.
fn is_covered(created_at: DateTime<Utc>, watermark: Option<DateTime<Utc>>) -> bool {
    watermark.is_some_and(|w| created_at <= w)
}
