use crate::config::PostgresConfig;
use crate::error::MfResult;
use crate::models::{RateOutcome, RatingEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

/// Durable, pull-based source of rating events.
///
/// At most one rating is kept per (user, item); re-rating overwrites the
/// value and the timestamp, so the newer rating shows up again past any
/// watermark taken before it.
#[async_trait]
pub trait RatingLog: Send + Sync {
    async fn append(&self, event: &RatingEvent) -> MfResult<RateOutcome>;

    /// Every rating, ordered by `created_at` then arrival.
    async fn fetch_all(&self) -> MfResult<Vec<RatingEvent>>;

    /// Ratings strictly newer than `watermark`; `None` means all of them.
    async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> MfResult<Vec<RatingEvent>>;

    /// Items the user has already rated.
    async fn rated_items(&self, user_id: &str) -> MfResult<Vec<String>>;

    async fn ping(&self) -> MfResult<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct RatingRow {
    user_id: String,
    item_id: String,
    rating: f64,
    created_at: DateTime<Utc>,
}

impl From<RatingRow> for RatingEvent {
    fn from(row: RatingRow) -> Self {
        RatingEvent {
            user_id: row.user_id,
            item_id: row.item_id,
            rating: row.rating,
            created_at: row.created_at,
        }
    }
}

pub struct PgRatingLog {
    pool: PgPool,
}

impl PgRatingLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PostgresConfig) -> MfResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        let log = Self::new(pool);
        log.ensure_schema().await?;
        info!(max_connections = config.max_connections, "Connected to rating log");
        Ok(log)
    }

    pub async fn ensure_schema(&self) -> MfResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_ratings (
                seq BIGSERIAL PRIMARY KEY,
                user_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                rating DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (user_id, item_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS user_ratings_created_at_idx ON user_ratings (created_at, seq)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RatingLog for PgRatingLog {
    async fn append(&self, event: &RatingEvent) -> MfResult<RateOutcome> {
        // xmax is zero only for a freshly inserted tuple
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO user_ratings (user_id, item_id, rating, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, item_id)
            DO UPDATE SET rating = EXCLUDED.rating, created_at = EXCLUDED.created_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&event.user_id)
        .bind(&event.item_id)
        .bind(event.rating)
        .bind(event.created_at)
        .fetch_one(&self.pool)
        .await?;

        let outcome = if inserted {
            RateOutcome::Created
        } else {
            RateOutcome::Updated
        };
        debug!(user_id = %event.user_id, item_id = %event.item_id, ?outcome, "Appended rating");
        Ok(outcome)
    }

    async fn fetch_all(&self) -> MfResult<Vec<RatingEvent>> {
        self.fetch_since(None).await
    }

    async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> MfResult<Vec<RatingEvent>> {
        let rows = sqlx::query_as::<_, RatingRow>(
            r#"
            SELECT user_id, item_id, rating, created_at
            FROM user_ratings
            WHERE $1::TIMESTAMPTZ IS NULL OR created_at > $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(watermark)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RatingEvent::from).collect())
    }

    async fn rated_items(&self, user_id: &str) -> MfResult<Vec<String>> {
        let items = sqlx::query_scalar("SELECT item_id FROM user_ratings WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn ping(&self) -> MfResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRating {
    seq: u64,
    event: RatingEvent,
}

#[derive(Debug, Default)]
struct LogState {
    next_seq: u64,
    rows: Vec<StoredRating>,
}

/// Same upsert and ordering rules as the Postgres log, kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryRatingLog {
    state: Mutex<LogState>,
}

impl InMemoryRatingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RatingLog for InMemoryRatingLog {
    async fn append(&self, event: &RatingEvent) -> MfResult<RateOutcome> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .rows
            .iter_mut()
            .find(|r| r.event.user_id == event.user_id && r.event.item_id == event.item_id)
        {
            existing.event.rating = event.rating;
            existing.event.created_at = event.created_at;
            return Ok(RateOutcome::Updated);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.rows.push(StoredRating {
            seq,
            event: event.clone(),
        });
        Ok(RateOutcome::Created)
    }

    async fn fetch_all(&self) -> MfResult<Vec<RatingEvent>> {
        self.fetch_since(None).await
    }

    async fn fetch_since(&self, watermark: Option<DateTime<Utc>>) -> MfResult<Vec<RatingEvent>> {
        let mut rows: Vec<StoredRating> = self
            .state
            .lock()
            .rows
            .iter()
            .filter(|r| watermark.map_or(true, |w| r.event.created_at > w))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.event.created_at, r.seq));
        Ok(rows.into_iter().map(|r| r.event).collect())
    }

    async fn rated_items(&self, user_id: &str) -> MfResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .rows
            .iter()
            .filter(|r| r.event.user_id == user_id)
            .map(|r| r.event.item_id.clone())
            .collect())
    }

    async fn ping(&self) -> MfResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_append_upserts() {
        let log = InMemoryRatingLog::new();
        let first = log.append(&RatingEvent::new("u1", "b1", 3.0, at(10))).await.unwrap();
        let second = log.append(&RatingEvent::new("u1", "b1", 5.0, at(20))).await.unwrap();

        assert_eq!(first, RateOutcome::Created);
        assert_eq!(second, RateOutcome::Updated);
        assert_eq!(log.len(), 1);

        let all = log.fetch_all().await.unwrap();
        assert_eq!(all[0].rating, 5.0);
        assert_eq!(all[0].created_at, at(20));
    }

    #[tokio::test]
    async fn test_fetch_since_is_strict_and_ordered() {
        let log = InMemoryRatingLog::new();
        log.append(&RatingEvent::new("u1", "b3", 1.0, at(30))).await.unwrap();
        log.append(&RatingEvent::new("u1", "b1", 1.0, at(10))).await.unwrap();
        log.append(&RatingEvent::new("u2", "b2", 1.0, at(20))).await.unwrap();
        log.append(&RatingEvent::new("u3", "b2", 1.0, at(20))).await.unwrap();

        let all = log.fetch_since(None).await.unwrap();
        let order: Vec<(&str, &str)> = all
            .iter()
            .map(|e| (e.user_id.as_str(), e.item_id.as_str()))
            .collect();
        // equal timestamps keep arrival order
        assert_eq!(order, vec![("u1", "b1"), ("u2", "b2"), ("u3", "b2"), ("u1", "b3")]);

        let newer = log.fetch_since(Some(at(20))).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].item_id, "b3");

        assert!(log.fetch_since(Some(at(30))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rated_items() {
        let log = InMemoryRatingLog::new();
        log.append(&RatingEvent::new("u1", "b1", 1.0, at(1))).await.unwrap();
        log.append(&RatingEvent::new("u1", "b2", 1.0, at(2))).await.unwrap();
        log.append(&RatingEvent::new("u2", "b3", 1.0, at(3))).await.unwrap();

        let mut items = log.rated_items("u1").await.unwrap();
        items.sort();
        assert_eq!(items, vec!["b1".to_string(), "b2".to_string()]);
        assert!(log.rated_items("ghost").await.unwrap().is_empty());
    }
}
