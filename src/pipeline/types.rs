//! Shared types for the feedback pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Lowest score any observation or average may take.
pub const MIN_SCORE: f64 = 1.0;

/// Highest score any observation or average may take.
pub const MAX_SCORE: f64 = 5.0;

/// Score assigned to empty feedback.
pub const NEUTRAL_SCORE: f64 = 3.0;

/// Whether `score` lies within `[MIN_SCORE, MAX_SCORE]`. NaN is out of range.
pub fn score_in_range(score: f64) -> bool {
    (MIN_SCORE..=MAX_SCORE).contains(&score)
}

// ── Entities ────────────────────────────────────────────────────────

/// Kind of thing a piece of feedback is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Driver,
    Trip,
    App,
    Marshal,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [Self::Driver, Self::Trip, Self::App, Self::Marshal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "DRIVER",
            Self::Trip => "TRIP",
            Self::App => "APP",
            Self::Marshal => "MARSHAL",
        }
    }

    /// Only drivers carry a running reputation score and alerts.
    pub fn is_scored(&self) -> bool {
        matches!(self, Self::Driver)
    }

    /// Display name for a stub entity created on first observation.
    pub fn stub_name(&self, entity_id: &str) -> String {
        let label = match self {
            Self::Driver => "Driver",
            Self::Trip => "Trip",
            Self::App => "App",
            Self::Marshal => "Marshal",
        };
        format!("{label} {entity_id}")
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRIVER" => Ok(Self::Driver),
            "TRIP" => Ok(Self::Trip),
            "APP" => Ok(Self::App),
            "MARSHAL" => Ok(Self::Marshal),
            other => Err(ValidationError::UnknownEntityType(other.to_string())),
        }
    }
}

/// A scored-or-reviewed entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ── Queue payload ───────────────────────────────────────────────────

/// A validated feedback submission waiting on the queue.
///
/// Serializes to the producer payload shape (`user_id`, `entity_type`,
/// `entity_id`, `text`) plus the job id assigned at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackJob {
    #[serde(default = "Uuid::new_v4")]
    pub job_id: Uuid,
    #[serde(rename = "user_id")]
    pub submitter_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub text: String,
}

impl FeedbackJob {
    pub fn new(
        submitter_id: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            submitter_id: submitter_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            text: text.into(),
        }
    }
}

// ── Persisted records ───────────────────────────────────────────────

/// A raw observation about to be staged.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedback {
    pub submitter_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub text: String,
    pub sentiment_score: f64,
    pub created_at: DateTime<Utc>,
}

impl NewFeedback {
    pub fn from_job(job: &FeedbackJob, sentiment_score: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            submitter_id: job.submitter_id.clone(),
            entity_type: job.entity_type,
            entity_id: job.entity_id.clone(),
            text: job.text.clone(),
            sentiment_score,
            created_at,
        }
    }
}

/// Persisted raw observation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackRecord {
    pub id: i64,
    pub submitter_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub text: String,
    pub sentiment_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Running reputation score for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityScore {
    pub entity_id: String,
    /// Exponential moving average, always within `[MIN_SCORE, MAX_SCORE]`.
    pub average_score: f64,
    /// Number of observations folded into the average.
    pub observation_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// One fired alert. Doubles as the throttle log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub entity_id: String,
    pub score_at_alert: f64,
    pub threshold_at_alert: f64,
    pub timestamp: DateTime<Utc>,
}
