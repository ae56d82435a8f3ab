use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mfrec::config::RetryConfig;
use mfrec::services::identity_store::InMemoryIdentityStore;
use mfrec::services::rating_log::InMemoryRatingLog;
use mfrec::services::snapshot::{InMemorySnapshotStore, SnapshotStamp, SnapshotStore};
use mfrec::services::Persistence;
use mfrec::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.model.n_factors = 4;
    config.model.epochs = 20;
    config
}

async fn seeded_state(ratings: &[(&str, &str, f64, i64)]) -> AppState {
    let persistence = Persistence::in_memory();
    for &(user, item, rating, secs) in ratings {
        persistence
            .append(&RatingEvent::new(user, item, rating, at(secs)))
            .await
            .unwrap();
    }
    AppState::with_persistence(test_config(), persistence).await.unwrap()
}

const CATALOG: &[(&str, &str, f64, i64)] = &[
    ("alice", "book1", 5.0, 10),
    ("alice", "book2", 3.0, 20),
    ("bob", "book1", 4.0, 30),
    ("bob", "book3", 2.0, 40),
    ("carol", "book2", 4.0, 50),
    ("carol", "book4", 5.0, 60),
];

#[tokio::test]
async fn test_requests_before_fit_are_not_ready() {
    let state = seeded_state(CATALOG).await;

    let request = RecommendationRequest::new("alice", 3);
    let result = state.recommendation_service.recommend(&request).await;
    assert!(matches!(result, Err(MfError::NotReady)));
    assert!(matches!(
        state.recommendation_service.batch_update().await,
        Err(MfError::NotReady)
    ));
}

#[tokio::test]
async fn test_fit_then_recommend_excludes_rated_items() {
    let state = seeded_state(CATALOG).await;
    let report = assert_ok!(state.training_service.fit().await);
    assert_eq!(report.n_ratings, 6);
    assert_eq!(report.watermark, Some(at(60)));

    let response = assert_ok!(
        state
            .recommendation_service
            .recommend(&RecommendationRequest::new("alice", 10))
            .await
    );
    let ids = response.item_ids();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&"book1"));
    assert!(!ids.contains(&"book2"));
    assert!(response.items.windows(2).all(|w| w[0].score >= w[1].score));

    let excluded = assert_ok!(
        state
            .recommendation_service
            .recommend(&RecommendationRequest::new("alice", 10).with_exclusions(vec!["book3".into()]))
            .await
    );
    assert_eq!(excluded.item_ids(), vec!["book4"]);
}

#[tokio::test]
async fn test_unknown_user_is_reported_not_created() {
    let state = seeded_state(CATALOG).await;
    assert_ok!(state.training_service.fit().await);

    let result = state
        .recommendation_service
        .recommend(&RecommendationRequest::new("mallory", 3))
        .await;
    assert!(matches!(result, Err(MfError::UnknownUser(_))));
    assert_eq!(state.recommendation_service.stats().await.n_users, 3);
}

#[tokio::test]
async fn test_batch_update_applies_only_newer_ratings() {
    let state = seeded_state(CATALOG).await;
    assert_ok!(state.training_service.fit().await);

    // nothing newer than the fit watermark yet
    let noop = state.recommendation_service.batch_update().await;
    assert!(assert_err!(noop).is_noop());

    let service = &state.recommendation_service;
    assert_ok!(service.rate(RatingEvent::new("dave", "book1", 4.0, at(70))).await);
    assert_ok!(service.rate(RatingEvent::new("alice", "book5", 2.0, at(90))).await);
    assert_ok!(service.rate(RatingEvent::new("erin", "book2", 3.0, at(80))).await);

    let report = assert_ok!(service.batch_update().await);
    assert_eq!(report.applied, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.new_users, 2);
    assert_eq!(report.new_items, 1);
    assert_eq!(report.watermark, Some(at(90)));

    let stats = service.stats().await;
    assert_eq!(stats.n_users, 5);
    assert_eq!(stats.n_items, 5);

    // the new state was persisted and mirrored
    let restored = state.persistence.load_snapshot().await.unwrap().unwrap();
    assert_eq!(restored.last_update_time(), Some(at(90)));
    assert_eq!(
        state.persistence.identity_store.lookup(EntityKind::User, "erin").await.unwrap(),
        Some(4)
    );

    assert!(assert_err!(service.batch_update().await).is_noop());
}

#[tokio::test]
async fn test_restart_restores_last_snapshot() {
    let persistence = Persistence::in_memory();
    for &(user, item, rating, secs) in CATALOG {
        persistence
            .append(&RatingEvent::new(user, item, rating, at(secs)))
            .await
            .unwrap();
    }

    let first = AppState::with_persistence(test_config(), persistence.clone())
        .await
        .unwrap();
    assert_ok!(first.training_service.fit().await);
    let before = assert_ok!(first.recommendation_service.predict("bob", "book4").await);

    let second = AppState::with_persistence(test_config(), persistence).await.unwrap();
    let after = assert_ok!(second.recommendation_service.predict("bob", "book4").await);
    assert!((before - after).abs() < 1e-12);
    assert_eq!(second.recommendation_service.stats().await.last_update_time, Some(at(60)));
}

#[tokio::test]
async fn test_invalid_rating_is_rejected_before_logging() {
    let state = seeded_state(&[]).await;
    let result = state
        .recommendation_service
        .rate(RatingEvent::new("", "book1", 4.0, at(1)))
        .await;
    assert!(matches!(result, Err(MfError::InvalidInput(_))));
    assert!(state.persistence.fetch_all().await.unwrap().is_empty());

    // fitting an empty log is an input error, not a crash
    assert!(matches!(
        state.training_service.fit().await,
        Err(MfError::InvalidInput(_))
    ));
}

async fn seed(persistence: &Persistence, ratings: &[(&str, &str, f64, i64)]) {
    for &(user, item, rating, secs) in ratings {
        persistence
            .append(&RatingEvent::new(user, item, rating, at(secs)))
            .await
            .unwrap();
    }
}

/// Snapshot store that starts failing saves once `broken` is set.
#[derive(Default)]
struct BrokenDisk {
    inner: InMemorySnapshotStore,
    broken: AtomicBool,
}

#[async_trait]
impl SnapshotStore for BrokenDisk {
    async fn save(&self, snapshot: &ModelSnapshot) -> MfResult<SnapshotStamp> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(MfError::Io(std::io::Error::other("read-only file system")));
        }
        self.inner.save(snapshot).await
    }

    async fn load(&self) -> MfResult<Option<ModelSnapshot>> {
        self.inner.load().await
    }

    async fn stamp(&self) -> MfResult<Option<SnapshotStamp>> {
        self.inner.stamp().await
    }
}

#[tokio::test]
async fn test_diverging_refit_keeps_previous_model() {
    let persistence = Persistence::in_memory();
    seed(&persistence, CATALOG).await;
    let server = AppState::with_persistence(test_config(), persistence.clone())
        .await
        .unwrap();
    assert_ok!(server.training_service.fit().await);
    let before = assert_ok!(server.recommendation_service.predict("carol", "book1").await);

    let mut reckless = test_config();
    reckless.model.learning_rate = 5.0;
    reckless.model.epochs = 50;
    let trainer = AppState::with_persistence(reckless, persistence.clone())
        .await
        .unwrap();
    let result = trainer.training_service.fit().await;
    assert!(matches!(assert_err!(result), MfError::Diverged(_)));

    // the saved snapshot is still the good one and still loads
    assert_ok!(persistence.load_snapshot().await);
    let after = assert_ok!(server.recommendation_service.predict("carol", "book1").await);
    assert_eq!(before, after);
    assert!(after.is_finite());
}

#[tokio::test]
async fn test_server_sees_worker_batches_without_replaying_them() {
    let persistence = Persistence::in_memory();
    seed(&persistence, CATALOG).await;
    let server = AppState::with_persistence(test_config(), persistence.clone())
        .await
        .unwrap();
    assert_ok!(server.training_service.fit().await);
    let worker = AppState::with_persistence(test_config(), persistence.clone())
        .await
        .unwrap();

    seed(&persistence, &[("dave", "book3", 5.0, 70), ("dave", "book4", 4.0, 80)]).await;
    let report = assert_ok!(worker.recommendation_service.batch_update().await);
    assert_eq!(report.applied, 2);

    let response = assert_ok!(
        server
            .recommendation_service
            .recommend(&RecommendationRequest::new("dave", 5))
            .await
    );
    assert_eq!(response.item_ids().len(), 2);
    assert!(!response.item_ids().contains(&"book3"));

    // both now hold the same model
    let served = assert_ok!(server.recommendation_service.predict("dave", "book1").await);
    let computed = assert_ok!(worker.recommendation_service.predict("dave", "book1").await);
    assert_eq!(served, computed);

    let noop = server.recommendation_service.batch_update().await;
    assert!(assert_err!(noop).is_noop());
    assert_eq!(server.recommendation_service.stats().await.last_update_time, Some(at(80)));
}

#[tokio::test]
async fn test_failed_save_does_not_change_served_model() {
    let disk = Arc::new(BrokenDisk::default());
    let persistence = Persistence::new(
        Arc::new(InMemoryRatingLog::new()),
        Arc::new(InMemoryIdentityStore::new()),
        disk.clone(),
        RetryConfig {
            max_retries: 0,
            initial_delay_ms: 0,
        },
    );
    seed(&persistence, CATALOG).await;
    let state = AppState::with_persistence(test_config(), persistence.clone())
        .await
        .unwrap();
    assert_ok!(state.training_service.fit().await);
    let before = assert_ok!(state.recommendation_service.predict("alice", "book3").await);

    disk.broken.store(true, Ordering::Relaxed);
    seed(&persistence, &[("alice", "book3", 1.0, 70), ("zoe", "book1", 2.0, 75)]).await;
    let result = state.recommendation_service.batch_update().await;
    assert!(assert_err!(result).is_persistence());

    let stats = state.recommendation_service.stats().await;
    assert_eq!(stats.n_users, 3);
    assert_eq!(stats.last_update_time, Some(at(60)));
    let after = assert_ok!(state.recommendation_service.predict("alice", "book3").await);
    assert_eq!(before, after);

    // once the disk recovers the same backlog applies exactly once
    disk.broken.store(false, Ordering::Relaxed);
    let report = assert_ok!(state.recommendation_service.batch_update().await);
    assert_eq!(report.applied, 2);
    assert_eq!(report.watermark, Some(at(75)));
}

#[tokio::test]
async fn test_identically_seeded_servers_agree_after_growth() {
    let mut answers = Vec::new();
    for _ in 0..2 {
        let state = seeded_state(CATALOG).await;
        assert_ok!(state.training_service.fit().await);
        let service = &state.recommendation_service;
        assert_ok!(service.rate(RatingEvent::new("erin", "book5", 4.0, at(70))).await);
        assert_ok!(service.rate(RatingEvent::new("bob", "book5", 2.0, at(71))).await);
        assert_ok!(service.batch_update().await);

        let response = assert_ok!(service.recommend(&RecommendationRequest::new("erin", 10)).await);
        let ranked: Vec<(String, f64)> = response
            .items
            .iter()
            .map(|item| (item.item_id.clone(), item.score))
            .collect();
        answers.push(ranked);
    }
    assert_eq!(answers[0], answers[1]);
    assert_eq!(answers[0].len(), 4);
}
