pub mod identity_store;
pub mod rating_log;
pub mod recommendation;
pub mod snapshot;
pub mod training;

use crate::algorithms::MfModel;
use crate::config::{Config, RetryConfig};
use crate::error::MfResult;
use crate::models::{EntityKind, RateOutcome, RatingEvent};
use crate::utils::retry_with_backoff;
use crate::utils::validation::validate_snapshot;
use chrono::{DateTime, Utc};
use identity_store::{IdentityStore, InMemoryIdentityStore, RedisIdentityStore};
use rating_log::{InMemoryRatingLog, PgRatingLog, RatingLog};
use snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStamp, SnapshotStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// The in-memory model together with the stamp of the snapshot it matches.
#[derive(Debug, Clone)]
pub struct LiveModel {
    pub model: MfModel,
    pub stamp: Option<SnapshotStamp>,
}

impl LiveModel {
    pub fn new(model: MfModel, stamp: Option<SnapshotStamp>) -> Self {
        Self { model, stamp }
    }
}

/// The single live model. `None` until a fit or a snapshot restore.
pub type SharedModel = Arc<RwLock<Option<LiveModel>>>;

pub fn empty_model() -> SharedModel {
    Arc::new(RwLock::new(None))
}

/// The three durable collaborators, each call wrapped in bounded retry.
#[derive(Clone)]
pub struct Persistence {
    pub rating_log: Arc<dyn RatingLog>,
    pub identity_store: Arc<dyn IdentityStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    retry: RetryConfig,
    mirror_degraded: Arc<AtomicBool>,
}

impl Persistence {
    pub fn new(
        rating_log: Arc<dyn RatingLog>,
        identity_store: Arc<dyn IdentityStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            rating_log,
            identity_store,
            snapshot_store,
            retry,
            mirror_degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Postgres rating log, Redis identity mirror and file snapshot.
    pub async fn connect(config: &Config) -> MfResult<Self> {
        let rating_log = PgRatingLog::connect(&config.postgres).await?;
        let identity_store = RedisIdentityStore::new(&config.redis)?;
        let snapshot_store = FileSnapshotStore::new(&config.snapshot.path);

        Ok(Self::new(
            Arc::new(rating_log),
            Arc::new(identity_store),
            Arc::new(snapshot_store),
            config.retry.clone(),
        ))
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryRatingLog::new()),
            Arc::new(InMemoryIdentityStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
            RetryConfig {
                max_retries: 0,
                initial_delay_ms: 0,
            },
        )
    }

    pub async fn append(&self, event: &RatingEvent) -> MfResult<RateOutcome> {
        let log = &self.rating_log;
        retry_with_backoff(move || log.append(event), self.retry.max_retries, self.retry.initial_delay()).await
    }

    pub async fn fetch_all(&self) -> MfResult<Vec<RatingEvent>> {
        let log = &self.rating_log;
        retry_with_backoff(move || log.fetch_all(), self.retry.max_retries, self.retry.initial_delay()).await
    }

    pub async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> MfResult<Vec<RatingEvent>> {
        let log = &self.rating_log;
        retry_with_backoff(
            move || log.fetch_since(watermark),
            self.retry.max_retries,
            self.retry.initial_delay(),
        )
        .await
    }

    pub async fn rated_items(&self, user_id: &str) -> MfResult<Vec<String>> {
        let log = &self.rating_log;
        retry_with_backoff(
            move || log.rated_items(user_id),
            self.retry.max_retries,
            self.retry.initial_delay(),
        )
        .await
    }

    /// Refuses to write a snapshot that could not be loaded back.
    pub async fn save_snapshot(&self, model: &MfModel) -> MfResult<SnapshotStamp> {
        let snapshot = model.to_snapshot();
        validate_snapshot(&snapshot)?;
        let store = &self.snapshot_store;
        let snapshot = &snapshot;
        retry_with_backoff(
            move || store.save(snapshot),
            self.retry.max_retries,
            self.retry.initial_delay(),
        )
        .await
    }

    pub async fn load_snapshot(&self) -> MfResult<Option<MfModel>> {
        let store = &self.snapshot_store;
        let snapshot =
            retry_with_backoff(move || store.load(), self.retry.max_retries, self.retry.initial_delay())
                .await?;
        snapshot.map(MfModel::from_snapshot).transpose()
    }

    pub async fn snapshot_stamp(&self) -> MfResult<Option<SnapshotStamp>> {
        let store = &self.snapshot_store;
        retry_with_backoff(move || store.stamp(), self.retry.max_retries, self.retry.initial_delay()).await
    }

    /// Loads the snapshot with its stamp. The stamp is read first, so a save
    /// racing with the load leaves a stamp that is older, never newer, than
    /// the model, and the next check reloads again.
    pub async fn load_live(&self) -> MfResult<Option<LiveModel>> {
        let stamp = self.snapshot_stamp().await?;
        Ok(self
            .load_snapshot()
            .await?
            .map(|model| LiveModel::new(model, stamp)))
    }

    /// Whether the last identity mirror write failed. Cleared by the next
    /// successful publish, replace or repair.
    pub fn mirror_degraded(&self) -> bool {
        self.mirror_degraded.load(Ordering::Relaxed)
    }

    fn track_mirror(&self, result: MfResult<()>) -> MfResult<()> {
        self.mirror_degraded.store(result.is_err(), Ordering::Relaxed);
        result
    }

    /// Publishes the bindings created since the model had `users_before` users
    /// and `items_before` items. A degraded mirror is repaired instead, since
    /// it may be missing earlier bindings too.
    pub async fn publish_growth(
        &self,
        model: &MfModel,
        users_before: usize,
        items_before: usize,
    ) -> MfResult<()> {
        if self.mirror_degraded() {
            return self.repair_bindings(model).await;
        }
        let result = self.publish_new(model, users_before, items_before).await;
        self.track_mirror(result)
    }

    async fn publish_new(&self, model: &MfModel, users_before: usize, items_before: usize) -> MfResult<()> {
        for (kind, before) in [(EntityKind::User, users_before), (EntityKind::Item, items_before)] {
            let bindings = model.identity().bindings_from(kind, before);
            if bindings.is_empty() {
                continue;
            }
            let store = &self.identity_store;
            let bindings = &bindings;
            retry_with_backoff(
                move || store.publish(kind, bindings),
                self.retry.max_retries,
                self.retry.initial_delay(),
            )
            .await?;
        }
        Ok(())
    }

    /// Makes the identity mirror match the model exactly.
    pub async fn replace_bindings(&self, model: &MfModel) -> MfResult<()> {
        let result = self.replace_all(model).await;
        self.track_mirror(result)
    }

    async fn replace_all(&self, model: &MfModel) -> MfResult<()> {
        for kind in [EntityKind::User, EntityKind::Item] {
            let bindings = model.identity().bindings(kind);
            let store = &self.identity_store;
            let bindings = &bindings;
            retry_with_backoff(
                move || store.replace_all(kind, bindings),
                self.retry.max_retries,
                self.retry.initial_delay(),
            )
            .await?;
        }
        info!(
            n_users = model.n_users(),
            n_items = model.n_items(),
            "Replaced identity bindings"
        );
        Ok(())
    }

    /// Republishes what the mirror is missing after a crash between a
    /// snapshot save and the matching publish.
    pub async fn repair_bindings(&self, model: &MfModel) -> MfResult<()> {
        let result = self.repair(model).await;
        self.track_mirror(result)
    }

    async fn repair(&self, model: &MfModel) -> MfResult<()> {
        for kind in [EntityKind::User, EntityKind::Item] {
            let store = &self.identity_store;
            let mirrored = retry_with_backoff(
                move || store.count(kind),
                self.retry.max_retries,
                self.retry.initial_delay(),
            )
            .await?;
            let expected = model.identity().len(kind);

            if mirrored > expected {
                warn!(%kind, mirrored, expected, "Identity mirror ahead of snapshot, replacing");
                return self.replace_all(model).await;
            }
            if mirrored < expected {
                warn!(%kind, mirrored, expected, "Identity mirror behind snapshot, republishing");
                let bindings = model.identity().bindings_from(kind, mirrored);
                let bindings = &bindings;
                retry_with_backoff(
                    move || store.publish(kind, bindings),
                    self.retry.max_retries,
                    self.retry.initial_delay(),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::tests::two_by_two;
    use crate::algorithms::{FactorStore, IdentityIndex};
    use crate::error::MfError;
    use crate::models::IdentityBinding;
    use async_trait::async_trait;

    /// Fails every write while `down` is set.
    #[derive(Default)]
    struct FlakyIdentityStore {
        inner: InMemoryIdentityStore,
        down: AtomicBool,
    }

    impl FlakyIdentityStore {
        fn check(&self) -> MfResult<()> {
            if self.down.load(Ordering::Relaxed) {
                return Err(MfError::Io(std::io::Error::other("connection refused")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl IdentityStore for FlakyIdentityStore {
        async fn publish(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()> {
            self.check()?;
            self.inner.publish(kind, bindings).await
        }

        async fn replace_all(&self, kind: EntityKind, bindings: &[IdentityBinding]) -> MfResult<()> {
            self.check()?;
            self.inner.replace_all(kind, bindings).await
        }

        async fn count(&self, kind: EntityKind) -> MfResult<usize> {
            self.inner.count(kind).await
        }

        async fn lookup(&self, kind: EntityKind, external_id: &str) -> MfResult<Option<usize>> {
            self.inner.lookup(kind, external_id).await
        }

        async fn ping(&self) -> MfResult<()> {
            self.check()
        }
    }

    #[tokio::test]
    async fn test_repair_republishes_missing_bindings() {
        let persistence = Persistence::in_memory();
        let mut model = two_by_two();
        persistence.replace_bindings(&model).await.unwrap();

        model.update("u2", "item0", 3.0, None).unwrap();
        persistence.repair_bindings(&model).await.unwrap();

        let store = &persistence.identity_store;
        assert_eq!(store.count(EntityKind::User).await.unwrap(), 3);
        assert_eq!(store.count(EntityKind::Item).await.unwrap(), 2);
        assert_eq!(store.lookup(EntityKind::User, "u2").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_publish_growth_only_sends_new_ids() {
        let persistence = Persistence::in_memory();
        let mut model = two_by_two();
        model.update("u0", "item9", 3.0, None).unwrap();
        persistence.publish_growth(&model, 2, 2).await.unwrap();

        let store = &persistence.identity_store;
        assert_eq!(store.count(EntityKind::User).await.unwrap(), 0);
        assert_eq!(store.lookup(EntityKind::Item, "item9").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_persistence() {
        let persistence = Persistence::in_memory();
        assert!(persistence.load_snapshot().await.unwrap().is_none());

        let model = two_by_two();
        persistence.save_snapshot(&model).await.unwrap();
        let restored = persistence.load_snapshot().await.unwrap().unwrap();
        assert_eq!(restored.n_items(), 2);
        assert!((restored.predict("u0", "item1").unwrap() - 4.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_save_refuses_non_finite_model() {
        let persistence = Persistence::in_memory();
        let store = FactorStore::from_parts(
            *two_by_two().store().hyperparameters(),
            f64::NAN,
            vec![vec![1.0, 0.0]],
            vec![vec![0.5, 0.0]],
            vec![0.0],
            vec![0.0],
            None,
        )
        .unwrap();
        let identity = IdentityIndex::from_ordered(vec!["u0".into()], vec!["item0".into()]).unwrap();
        let model = MfModel::from_parts(store, identity).unwrap();

        let result = persistence.save_snapshot(&model).await;
        assert!(matches!(result, Err(MfError::CorruptSnapshot(_))));
        assert!(persistence.snapshot_stamp().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_mirror_write_marks_degraded_until_repaired() {
        let flaky = Arc::new(FlakyIdentityStore::default());
        let persistence = Persistence::new(
            Arc::new(InMemoryRatingLog::new()),
            flaky.clone(),
            Arc::new(InMemorySnapshotStore::new()),
            RetryConfig {
                max_retries: 0,
                initial_delay_ms: 0,
            },
        );
        let mut model = two_by_two();
        persistence.replace_bindings(&model).await.unwrap();
        assert!(!persistence.mirror_degraded());

        flaky.down.store(true, Ordering::Relaxed);
        model.update("u2", "item0", 3.0, None).unwrap();
        assert!(persistence.publish_growth(&model, 2, 2).await.is_err());
        assert!(persistence.mirror_degraded());

        // the next growth publish repairs everything the mirror missed
        flaky.down.store(false, Ordering::Relaxed);
        model.update("u3", "item0", 3.0, None).unwrap();
        persistence.publish_growth(&model, 3, 2).await.unwrap();
        assert!(!persistence.mirror_degraded());
        assert_eq!(flaky.lookup(EntityKind::User, "u2").await.unwrap(), Some(2));
        assert_eq!(flaky.lookup(EntityKind::User, "u3").await.unwrap(), Some(3));
    }
}
