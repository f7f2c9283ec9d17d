//! Read-side admin views over committed data.

use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::{AlertRecord, EntityScore, EntityType, FeedbackRecord};
use crate::store::traits::FeedbackStore;

/// How many feedback records `entity_analytics` returns by default.
pub const RECENT_FEEDBACK_LIMIT: usize = 20;

const RECENT_ALERT_LIMIT: usize = 10;

/// Snapshot of one entity's reputation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityAnalytics {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub name: String,
    /// Average rounded to two decimals. `None` before the first observation.
    pub current_score: Option<f64>,
    pub feedback_count: i64,
    /// Newest first.
    pub recent_feedback: Vec<FeedbackRecord>,
    /// Newest first.
    pub recent_alerts: Vec<AlertRecord>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Analytics for `entity_id`, or `None` if the entity is unknown.
pub async fn entity_analytics(
    store: &dyn FeedbackStore,
    entity_id: &str,
    feedback_limit: usize,
) -> Result<Option<EntityAnalytics>, DatabaseError> {
    let Some(entity) = store.get_entity(entity_id).await? else {
        return Ok(None);
    };

    let score = store.get_entity_score(entity_id).await?;
    let recent_feedback = store
        .list_feedback_for_entity(entity_id, feedback_limit)
        .await?;
    let recent_alerts = store
        .list_alerts_for_entity(entity_id, RECENT_ALERT_LIMIT)
        .await?;

    Ok(Some(EntityAnalytics {
        entity_id: entity.id,
        entity_type: entity.entity_type,
        name: entity.name,
        current_score: score.as_ref().map(|s| round2(s.average_score)),
        feedback_count: score.map_or(0, |s| s.observation_count),
        recent_feedback,
        recent_alerts,
    }))
}

/// Scored entities, lowest average first.
pub async fn score_board(
    store: &dyn FeedbackStore,
    limit: usize,
) -> Result<Vec<EntityScore>, DatabaseError> {
    store.list_entity_scores(limit).await
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::pipeline::types::NewFeedback;
    use crate::store::libsql_backend::LibSqlBackend;
    use crate::store::traits::StoreTransaction;

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(round2(3.6199999), 3.62);
        assert_eq!(round2(2.786), 2.79);
        assert_eq!(round2(4.0), 4.0);
    }

    #[tokio::test]
    async fn unknown_entity_is_none() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(entity_analytics(&db, "nope", 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn analytics_include_score_and_history() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        let mut tx = db.begin().await.unwrap();
        tx.ensure_entity("D1", EntityType::Driver, now).await.unwrap();
        for i in 0..3 {
            tx.insert_feedback(&NewFeedback {
                submitter_id: "u1".into(),
                entity_type: EntityType::Driver,
                entity_id: "D1".into(),
                text: format!("ride {i}"),
                sentiment_score: 3.0,
                created_at: now + chrono::Duration::seconds(i),
            })
            .await
            .unwrap();
        }
        tx.upsert_entity_score(&EntityScore {
            entity_id: "D1".into(),
            average_score: 3.6199999,
            observation_count: 3,
            last_updated: now,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let analytics = entity_analytics(&db, "D1", 2).await.unwrap().unwrap();
        assert_eq!(analytics.name, "Driver D1");
        assert_eq!(analytics.current_score, Some(3.62));
        assert_eq!(analytics.feedback_count, 3);
        assert_eq!(analytics.recent_feedback.len(), 2);
        assert_eq!(analytics.recent_feedback[0].text, "ride 2");
        assert!(analytics.recent_alerts.is_empty());
    }

    #[tokio::test]
    async fn entity_without_score_reports_none() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut tx = db.begin().await.unwrap();
        tx.ensure_entity("D9", EntityType::Driver, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let analytics = entity_analytics(&db, "D9", RECENT_FEEDBACK_LIMIT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(analytics.current_score, None);
        assert_eq!(analytics.feedback_count, 0);
    }
}
