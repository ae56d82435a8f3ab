//! Online updates and watermark replay on a live model.

use super::MfModel;
use crate::error::{MfError, MfResult};
use crate::models::{BatchUpdateReport, EntityKind, RatingEvent, UpdateOutcome};
use crate::utils::validation::validate_rating_parts;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

impl MfModel {
    /// Applies one rating, growing the model first if either id is new.
    ///
    /// The event is validated before any identity is allocated, so a rejected
    /// event leaves the model untouched.
    pub fn update(
        &mut self,
        user_id: &str,
        item_id: &str,
        rating: f64,
        event_time: Option<DateTime<Utc>>,
    ) -> MfResult<UpdateOutcome> {
        validate_rating_parts(user_id, item_id, rating)?;

        let (user_index, created_user) = self.resolve_or_grow(EntityKind::User, user_id);
        let (item_index, created_item) = self.resolve_or_grow(EntityKind::Item, item_id);
        self.store.sgd_step(user_index, item_index, rating)?;

        if let Some(event_time) = event_time {
            self.store.advance_watermark(event_time);
        }

        if created_user || created_item {
            debug!(
                user_id,
                item_id,
                created_user,
                created_item,
                "Grew model for unseen identity"
            );
        }

        Ok(UpdateOutcome {
            user_index,
            item_index,
            created_user,
            created_item,
            watermark: self.store.last_update_time(),
        })
    }

    pub fn apply_event(&mut self, event: &RatingEvent) -> MfResult<UpdateOutcome> {
        self.update(
            &event.user_id,
            &event.item_id,
            event.rating,
            Some(event.created_at),
        )
    }

    /// Replays a backlog in `created_at` order (stable, so ties keep arrival order).
    ///
    /// A failing event is logged and counted; the rest of the batch still applies.
    pub fn replay(&mut self, events: &[RatingEvent]) -> MfResult<BatchUpdateReport> {
        if events.is_empty() {
            return Err(MfError::NoNewRatings {
                watermark: self.last_update_time(),
            });
        }

        let mut ordered: Vec<&RatingEvent> = events.iter().collect();
        ordered.sort_by_key(|event| event.created_at);

        let mut report = BatchUpdateReport::default();
        for event in ordered {
            match self.apply_event(event) {
                Ok(outcome) => {
                    report.applied += 1;
                    report.new_users += usize::from(outcome.created_user);
                    report.new_items += usize::from(outcome.created_item);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        user_id = %event.user_id,
                        item_id = %event.item_id,
                        error = %e,
                        "Skipping rating event during replay"
                    );
                }
            }
        }
        report.watermark = self.last_update_time();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::two_by_two;
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_update_grows_for_new_user() {
        let mut model = two_by_two();
        let outcome = model.update("newUser", "item0", 5.0, Some(at(100))).unwrap();

        assert!(outcome.created_user);
        assert!(!outcome.created_item);
        assert_eq!(outcome.user_index, 2);
        assert_eq!(model.n_users(), 3);
        assert_eq!(model.store().user_biases().len(), 3);
        assert_eq!(model.identity().len(EntityKind::User), 3);
        assert_eq!(model.last_update_time(), Some(at(100)));
    }

    #[test]
    fn test_update_grows_both_kinds() {
        let mut model = two_by_two();
        let outcome = model.update("u9", "item9", 2.0, None).unwrap();
        assert!(outcome.created_user && outcome.created_item);
        assert_eq!(model.n_users(), 3);
        assert_eq!(model.n_items(), 3);
        assert_eq!(model.last_update_time(), None);
    }

    #[test]
    fn test_update_keeps_newer_watermark() {
        let mut model = two_by_two();
        model.update("u0", "item0", 5.0, Some(at(200))).unwrap();
        model.update("u1", "item1", 1.0, Some(at(150))).unwrap();
        assert_eq!(model.last_update_time(), Some(at(200)));
    }

    #[test]
    fn test_rejected_update_allocates_nothing() {
        let mut model = two_by_two();
        assert!(model.update("ghost", "item0", f64::NAN, Some(at(1))).is_err());
        assert_eq!(model.n_users(), 2);
        assert_eq!(model.identity().lookup(EntityKind::User, "ghost"), None);
        assert_eq!(model.last_update_time(), None);
    }

    #[test]
    fn test_replay_orders_and_counts() {
        let mut model = two_by_two();
        let events = vec![
            RatingEvent::new("u0", "item1", 5.0, at(30)),
            RatingEvent::new("", "item1", 5.0, at(40)),
            RatingEvent::new("u3", "item0", 1.0, at(10)),
            RatingEvent::new("u3", "item7", 2.0, at(20)),
        ];

        let report = model.replay(&events).unwrap();

        assert_eq!(report.applied, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.new_users, 1);
        assert_eq!(report.new_items, 1);
        assert_eq!(report.watermark, Some(at(30)));
        // u3 was seen first (t=10), item7 second (t=20)
        assert_eq!(model.identity().lookup(EntityKind::User, "u3"), Some(2));
        assert_eq!(model.identity().lookup(EntityKind::Item, "item7"), Some(2));
    }

    #[test]
    fn test_replay_empty_is_noop() {
        let mut model = two_by_two();
        assert!(matches!(model.replay(&[]), Err(MfError::NoNewRatings { watermark: None })));
    }
}
