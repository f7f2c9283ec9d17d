//! Ingestion boundary: turns raw submissions into queued jobs.
//!
//! Everything that can be rejected up front is rejected here: missing
//! fields, unknown entity types, and entity types switched off by feature
//! flag. The worker only ever sees well-formed jobs.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::SharedConfig;
use crate::error::{Result, ValidationError};
use crate::pipeline::queue::JobQueue;
use crate::pipeline::types::{EntityType, FeedbackJob};

/// A submission as received from a producer. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedbackSubmission {
    pub user_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub text: Option<String>,
}

pub struct FeedbackIngestor {
    queue: Arc<dyn JobQueue>,
    config: SharedConfig,
}

impl FeedbackIngestor {
    pub fn new(queue: Arc<dyn JobQueue>, config: SharedConfig) -> Self {
        Self { queue, config }
    }

    /// Validate `submission` and enqueue it on behalf of `submitter_id`.
    pub fn submit(&self, submitter_id: &str, submission: FeedbackSubmission) -> Result<FeedbackJob> {
        let job = self.validate(submitter_id, submission).inspect_err(|e| {
            warn!(submitter_id = %submitter_id, error = %e, "Feedback submission rejected");
        })?;

        self.queue.enqueue(job.clone())?;
        info!(
            job_id = %job.job_id,
            entity_type = %job.entity_type,
            entity_id = %job.entity_id,
            submitter_id = %job.submitter_id,
            "Feedback queued"
        );
        Ok(job)
    }

    fn validate(
        &self,
        submitter_id: &str,
        submission: FeedbackSubmission,
    ) -> std::result::Result<FeedbackJob, ValidationError> {
        // Only absent or empty values count as missing; whitespace goes through.
        let present = |v: Option<String>| v.filter(|s| !s.is_empty());
        let entity_type = present(submission.entity_type);
        let entity_id = present(submission.entity_id);
        let text = present(submission.text);

        let mut missing = Vec::new();
        if entity_type.is_none() {
            missing.push("entity_type");
        }
        if entity_id.is_none() {
            missing.push("entity_id");
        }
        if text.is_none() {
            missing.push("text");
        }
        let (Some(entity_type), Some(entity_id), Some(text)) = (entity_type, entity_id, text)
        else {
            return Err(ValidationError::MissingFields(missing));
        };

        let entity_type: EntityType = entity_type.parse()?;
        if !self.config.snapshot().feature_flags.is_enabled(entity_type) {
            return Err(ValidationError::FeatureDisabled(entity_type));
        }

        Ok(FeedbackJob::new(submitter_id, entity_type, entity_id, text))
    }
}
