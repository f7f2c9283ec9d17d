//! Running reputation score per entity.
//!
//! Each observation is folded into an exponential moving average:
//! `new = alpha * observation + (1 - alpha) * old`. The first observation
//! seeds the average directly. Alpha is read from the live configuration at
//! call time, so an update applies to the next observation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::SharedConfig;
use crate::error::ProcessingError;
use crate::pipeline::locks::{EntityGuard, EntityLocks};
use crate::pipeline::types::{EntityScore, EntityType, MAX_SCORE, MIN_SCORE, score_in_range};
use crate::store::traits::StoreTransaction;

/// One EMA step. Result is clamped to the score range.
pub fn ema_step(previous: f64, observation: f64, alpha: f64) -> f64 {
    (alpha * observation + (1.0 - alpha) * previous).clamp(MIN_SCORE, MAX_SCORE)
}

/// Folds observations into `EntityScore` rows inside a job's transaction.
pub struct ScoreAggregator {
    config: SharedConfig,
    locks: Arc<EntityLocks>,
    lock_timeout: Duration,
}

impl ScoreAggregator {
    pub fn new(config: SharedConfig, locks: Arc<EntityLocks>, lock_timeout: Duration) -> Self {
        Self {
            config,
            locks,
            lock_timeout,
        }
    }

    /// Take exclusive access to `entity_id`. Hold the guard across `update`
    /// and the commit that follows it.
    pub async fn lock(&self, entity_id: &str) -> Result<EntityGuard, ProcessingError> {
        self.locks.acquire(entity_id, self.lock_timeout).await
    }

    /// Fold `observation` into the entity's average and stage the new row.
    ///
    /// Creates a stub entity and a fresh score row on first observation.
    /// Returns the updated average.
    pub async fn update(
        &self,
        tx: &mut dyn StoreTransaction,
        guard: &EntityGuard,
        entity_type: EntityType,
        observation: f64,
        now: DateTime<Utc>,
    ) -> Result<f64, ProcessingError> {
        let entity_id = guard.entity_id();
        if !score_in_range(observation) {
            return Err(ProcessingError::Classification {
                classifier: "aggregator input".into(),
                score: observation,
            });
        }

        let next = match tx.lock_entity_score(entity_id).await? {
            None => {
                tx.ensure_entity(entity_id, entity_type, now).await?;
                EntityScore {
                    entity_id: entity_id.to_string(),
                    average_score: observation,
                    observation_count: 1,
                    last_updated: now,
                }
            }
            Some(current) => {
                let alpha = self.config.snapshot().ema_alpha;
                EntityScore {
                    average_score: ema_step(current.average_score, observation, alpha),
                    observation_count: current.observation_count + 1,
                    last_updated: now,
                    ..current
                }
            }
        };

        tx.upsert_entity_score(&next).await?;
        debug!(
            entity_id = %entity_id,
            observation,
            average = next.average_score,
            count = next.observation_count,
            "Entity score staged"
        );
        Ok(next.average_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigUpdate, ScoringConfig};
    use crate::store::libsql_backend::LibSqlBackend;
    use crate::store::traits::FeedbackStore;

    fn aggregator(alpha: f64) -> ScoreAggregator {
        let config = SharedConfig::new(ScoringConfig {
            ema_alpha: alpha,
            ..Default::default()
        });
        ScoreAggregator::new(config, Arc::new(EntityLocks::new()), Duration::from_secs(1))
    }

    async fn fold(
        db: &LibSqlBackend,
        agg: &ScoreAggregator,
        entity_id: &str,
        observation: f64,
    ) -> f64 {
        let guard = agg.lock(entity_id).await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let avg = agg
            .update(tx.as_mut(), &guard, EntityType::Driver, observation, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        avg
    }

    #[test]
    fn ema_step_matches_formula() {
        assert!((ema_step(4.0, 2.0, 0.1) - 3.8).abs() < 1e-9);
        assert!((ema_step(3.8, 2.0, 0.1) - 3.62).abs() < 1e-9);
        assert_eq!(ema_step(2.0, 5.0, 1.0), 5.0);
    }

    #[tokio::test]
    async fn first_observation_seeds_average() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let agg = aggregator(0.1);
        assert_eq!(fold(&db, &agg, "D1", 4.0).await, 4.0);

        let score = db.get_entity_score("D1").await.unwrap().unwrap();
        assert_eq!(score.observation_count, 1);
        assert_eq!(score.average_score, 4.0);
        let entity = db.get_entity("D1").await.unwrap().unwrap();
        assert_eq!(entity.name, "Driver D1");
    }

    #[tokio::test]
    async fn subsequent_observations_use_ema() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let agg = aggregator(0.1);
        fold(&db, &agg, "D1", 4.0).await;
        let second = fold(&db, &agg, "D1", 2.0).await;
        let third = fold(&db, &agg, "D1", 2.0).await;
        assert!((second - 3.8).abs() < 1e-9);
        assert!((third - 3.62).abs() < 1e-9);

        let score = db.get_entity_score("D1").await.unwrap().unwrap();
        assert_eq!(score.observation_count, 3);
    }

    #[tokio::test]
    async fn order_matters() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let agg = aggregator(0.5);
        fold(&db, &agg, "A", 5.0).await;
        let a = fold(&db, &agg, "A", 1.0).await;
        fold(&db, &agg, "B", 1.0).await;
        let b = fold(&db, &agg, "B", 5.0).await;
        assert_eq!(a, 3.0);
        assert_eq!(b, 3.0);

        let agg = aggregator(0.1);
        fold(&db, &agg, "C", 5.0).await;
        let c = fold(&db, &agg, "C", 1.0).await;
        fold(&db, &agg, "E", 1.0).await;
        let e = fold(&db, &agg, "E", 5.0).await;
        assert!((c - 4.6).abs() < 1e-9);
        assert!((e - 1.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn alpha_change_applies_to_next_observation() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let agg = aggregator(0.1);
        fold(&db, &agg, "D1", 4.0).await;
        agg.config
            .apply(ConfigUpdate {
                ema_alpha: Some(1.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(fold(&db, &agg, "D1", 2.0).await, 2.0);
    }

    #[tokio::test]
    async fn out_of_range_observation_is_rejected() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let agg = aggregator(0.1);
        let guard = agg.lock("D1").await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let err = agg
            .update(tx.as_mut(), &guard, EntityType::Driver, 7.0, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Classification { .. }));
        tx.rollback().await.unwrap();
        assert!(db.get_entity_score("D1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_times_out_while_held() {
        let agg = ScoreAggregator::new(
            SharedConfig::default(),
            Arc::new(EntityLocks::new()),
            Duration::from_millis(20),
        );
        let _held = agg.lock("D1").await.unwrap();
        assert!(matches!(
            agg.lock("D1").await,
            Err(ProcessingError::AggregationConflict { .. })
        ));
    }
}
