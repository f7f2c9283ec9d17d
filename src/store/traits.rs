//! Store traits: the transactional persistence seam.
//!
//! `FeedbackStore` is the shared handle: it opens transactions and serves
//! committed reads. `StoreTransaction` stages the writes of one job; nothing
//! it writes is visible to readers until `commit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{
    AlertRecord, Entity, EntityScore, EntityType, FeedbackRecord, NewFeedback,
};

/// Backend-agnostic store for feedback, scores and alerts.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Open a transaction for one unit of work.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError>;

    // ── Committed reads ─────────────────────────────────────────────

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>, DatabaseError>;

    async fn get_entity_score(&self, entity_id: &str)
    -> Result<Option<EntityScore>, DatabaseError>;

    /// Scored entities, lowest average first.
    async fn list_entity_scores(&self, limit: usize) -> Result<Vec<EntityScore>, DatabaseError>;

    /// Feedback about an entity, newest first.
    async fn list_feedback_for_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<FeedbackRecord>, DatabaseError>;

    /// Alerts for an entity, newest first.
    async fn list_alerts_for_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<AlertRecord>, DatabaseError>;

    async fn count_feedback(&self) -> Result<i64, DatabaseError>;
}

/// Staged writes for one job.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Stage a raw observation.
    async fn insert_feedback(
        &mut self,
        feedback: &NewFeedback,
    ) -> Result<FeedbackRecord, DatabaseError>;

    /// Create a stub entity if none exists. Returns `true` if one was created.
    async fn ensure_entity(
        &mut self,
        entity_id: &str,
        entity_type: EntityType,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Read an entity's score row with intent to update it.
    async fn lock_entity_score(
        &mut self,
        entity_id: &str,
    ) -> Result<Option<EntityScore>, DatabaseError>;

    /// Insert or replace an entity's score row.
    async fn upsert_entity_score(&mut self, score: &EntityScore) -> Result<(), DatabaseError>;

    /// Most recent alert for `entity_id` at or after `since`.
    async fn latest_alert_since(
        &mut self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, DatabaseError>;

    /// Stage a fired alert.
    async fn insert_alert(
        &mut self,
        entity_id: &str,
        score_at_alert: f64,
        threshold_at_alert: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<AlertRecord, DatabaseError>;

    /// Make every staged write visible at once.
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    /// Discard every staged write.
    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}
