//! Per-entity exclusive sections.
//!
//! A job that touches an entity's score holds that entity's `EntityGuard`
//! from before its transaction opens until after it commits or rolls back.
//! With one worker the guard is never contended; it keeps per-entity
//! read-modify-write serialized if more consumers are ever added.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::ProcessingError;

/// Idle lock entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Mutex keyed by entity id.
#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the holder has exclusive access to one entity.
#[derive(Debug)]
pub struct EntityGuard {
    entity_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl EntityGuard {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `entity_id`.
    pub async fn acquire(
        &self,
        entity_id: &str,
        timeout: Duration,
    ) -> Result<EntityGuard, ProcessingError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > PRUNE_THRESHOLD {
                // Only the map references an idle lock.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(entity_id.to_string()).or_default())
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(entity_id = %entity_id, "Entity lock acquired");
                Ok(EntityGuard {
                    entity_id: entity_id.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                warn!(entity_id = %entity_id, waited = ?timeout, "Entity lock timed out");
                Err(ProcessingError::AggregationConflict {
                    entity_id: entity_id.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Number of tracked entities (held or idle).
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
