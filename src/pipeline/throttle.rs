//! Low-score alerting with a per-entity cool-down.
//!
//! An alert fires when an updated average falls strictly below the
//! configured threshold and no alert for the same entity was recorded within
//! the throttle window. The alert log doubles as the throttle state, and is
//! written in the same transaction as the score that triggered it.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::SharedConfig;
use crate::error::ProcessingError;
use crate::pipeline::types::AlertRecord;
use crate::store::traits::StoreTransaction;

/// What the throttler decided for one updated score.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertDecision {
    /// Average at or above the threshold.
    NotBelowThreshold,
    /// Below threshold, but an alert already fired within the window.
    Throttled { last_alert_at: DateTime<Utc> },
    /// Alert staged.
    Fired(AlertRecord),
}

impl AlertDecision {
    pub fn fired(&self) -> bool {
        matches!(self, Self::Fired(_))
    }
}

pub struct AlertThrottler {
    config: SharedConfig,
}

impl AlertThrottler {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Decide whether `score` warrants an alert and stage it if so.
    ///
    /// Must run in the transaction that staged the score, while the entity's
    /// guard is held.
    pub async fn check_and_record(
        &self,
        tx: &mut dyn StoreTransaction,
        entity_id: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<AlertDecision, ProcessingError> {
        let config = self.config.snapshot();
        if score >= config.alert_threshold {
            return Ok(AlertDecision::NotBelowThreshold);
        }

        let since = now - config.throttle_window();
        if let Some(last) = tx.latest_alert_since(entity_id, since).await? {
            warn!(
                entity_id = %entity_id,
                score,
                last_alert_at = %last.timestamp,
                "Alert throttled"
            );
            return Ok(AlertDecision::Throttled {
                last_alert_at: last.timestamp,
            });
        }

        let alert = tx
            .insert_alert(entity_id, score, config.alert_threshold, now)
            .await?;
        warn!(
            entity_id = %entity_id,
            score,
            threshold = config.alert_threshold,
            "Low score alert fired"
        );
        Ok(AlertDecision::Fired(alert))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound};

    use super::*;
    use crate::config::ScoringConfig;
    use crate::store::libsql_backend::LibSqlBackend;
    use crate::store::traits::FeedbackStore;

    fn throttler(threshold: f64, minutes: u32) -> AlertThrottler {
        AlertThrottler::new(SharedConfig::new(ScoringConfig {
            alert_threshold: threshold,
            alert_throttle_minutes: minutes,
            ..Default::default()
        }))
    }

    async fn check(
        db: &LibSqlBackend,
        t: &AlertThrottler,
        score: f64,
        now: DateTime<Utc>,
    ) -> AlertDecision {
        let mut tx = db.begin().await.unwrap();
        let decision = t.check_and_record(tx.as_mut(), "D1", score, now).await.unwrap();
        tx.commit().await.unwrap();
        decision
    }

    #[tokio::test]
    async fn score_at_threshold_does_not_alert() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let t = throttler(2.5, 60);
        assert_eq!(
            check(&db, &t, 2.5, Utc::now()).await,
            AlertDecision::NotBelowThreshold
        );
        assert!(db.list_alerts_for_entity("D1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_alert_within_window_is_throttled() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let t = throttler(2.5, 60);
        // Stored timestamps carry microsecond precision.
        let start = Utc::now().trunc_subsecs(6);

        let first = check(&db, &t, 1.0, start).await;
        let AlertDecision::Fired(alert) = &first else {
            panic!("expected alert, got {first:?}");
        };
        assert_eq!(alert.threshold_at_alert, 2.5);
        assert_eq!(alert.score_at_alert, 1.0);

        let second = check(&db, &t, 1.1, start + Duration::minutes(30)).await;
        assert!(matches!(second, AlertDecision::Throttled { last_alert_at } if last_alert_at == start));

        let third = check(&db, &t, 1.2, start + Duration::minutes(61)).await;
        assert!(third.fired());

        assert_eq!(db.list_alerts_for_entity("D1", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rolled_back_alert_does_not_throttle() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let t = throttler(2.5, 60);
        let now = Utc::now();

        let mut tx = db.begin().await.unwrap();
        assert!(t.check_and_record(tx.as_mut(), "D1", 1.0, now).await.unwrap().fired());
        tx.rollback().await.unwrap();

        assert!(check(&db, &t, 1.0, now).await.fired());
    }

    #[tokio::test]
    async fn zero_window_never_throttles_a_later_alert() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let t = throttler(2.5, 0);
        let now = Utc::now();
        assert!(check(&db, &t, 1.0, now).await.fired());
        assert!(check(&db, &t, 1.0, now + Duration::seconds(1)).await.fired());
    }
}
