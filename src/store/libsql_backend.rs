//! libSQL backend: async `FeedbackStore` implementation.
//!
//! One connection is shared by every caller. A write gate serializes
//! transactions: `begin()` holds it until commit or rollback, and committed
//! reads wait for it, so no reader ever sees a half-staged job.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{
    AlertRecord, Entity, EntityScore, EntityType, FeedbackRecord, NewFeedback,
};
use crate::store::migrations;
use crate::store::traits::{FeedbackStore, StoreTransaction};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: Arc<Mutex<()>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: Arc::new(Mutex::new(())),
        })
    }

    /// Take the write gate, first rolling back any transaction that was
    /// dropped without commit or rollback.
    async fn lock_gate(&self) -> Result<OwnedMutexGuard<()>, DatabaseError> {
        let gate = Arc::clone(&self.gate).lock_owned().await;
        if !self.conn.is_autocommit() {
            warn!("Rolling back transaction abandoned without commit or rollback");
            self.conn
                .execute("ROLLBACK", ())
                .await
                .map_err(|e| DatabaseError::Transaction(format!("recover: {e}")))?;
        }
        Ok(gate)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so SQL string comparison orders correctly.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_entity_type(s: &str) -> Result<EntityType, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("entity_type column: {e}")))
}

const ENTITY_COLUMNS: &str = "id, entity_type, name, created_at";

const FEEDBACK_COLUMNS: &str =
    "id, submitter_id, entity_type, entity_id, text, sentiment_score, created_at";

const SCORE_COLUMNS: &str = "entity_id, average_score, observation_count, last_updated";

const ALERT_COLUMNS: &str = "id, entity_id, score_at_alert, threshold_at_alert, timestamp";

fn row_to_entity(row: &libsql::Row) -> Result<Entity, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("entity row parse: {e}"));
    Ok(Entity {
        id: row.get(0).map_err(map)?,
        entity_type: parse_entity_type(&row.get::<String>(1).map_err(map)?)?,
        name: row.get(2).map_err(map)?,
        created_at: parse_datetime(&row.get::<String>(3).map_err(map)?),
    })
}

fn row_to_feedback(row: &libsql::Row) -> Result<FeedbackRecord, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("feedback row parse: {e}"));
    Ok(FeedbackRecord {
        id: row.get(0).map_err(map)?,
        submitter_id: row.get(1).map_err(map)?,
        entity_type: parse_entity_type(&row.get::<String>(2).map_err(map)?)?,
        entity_id: row.get(3).map_err(map)?,
        text: row.get(4).map_err(map)?,
        sentiment_score: row.get(5).map_err(map)?,
        created_at: parse_datetime(&row.get::<String>(6).map_err(map)?),
    })
}

fn row_to_score(row: &libsql::Row) -> Result<EntityScore, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("score row parse: {e}"));
    Ok(EntityScore {
        entity_id: row.get(0).map_err(map)?,
        average_score: row.get(1).map_err(map)?,
        observation_count: row.get(2).map_err(map)?,
        last_updated: parse_datetime(&row.get::<String>(3).map_err(map)?),
    })
}

fn row_to_alert(row: &libsql::Row) -> Result<AlertRecord, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("alert row parse: {e}"));
    Ok(AlertRecord {
        id: row.get(0).map_err(map)?,
        entity_id: row.get(1).map_err(map)?,
        score_at_alert: row.get(2).map_err(map)?,
        threshold_at_alert: row.get(3).map_err(map)?,
        timestamp: parse_datetime(&row.get::<String>(4).map_err(map)?),
    })
}

/// Run a query and map every row.
async fn query_all<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl libsql::params::IntoParams,
    map_row: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        out.push(map_row(&row)?);
    }
    Ok(out)
}

/// Run a query and map the first row, if any.
async fn query_one<T>(
    conn: &Connection,
    op: &str,
    sql: &str,
    params: impl libsql::params::IntoParams,
    map_row: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(map_row(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

async fn select_entity_score(
    conn: &Connection,
    entity_id: &str,
) -> Result<Option<EntityScore>, DatabaseError> {
    query_one(
        conn,
        "get_entity_score",
        &format!("SELECT {SCORE_COLUMNS} FROM entity_scores WHERE entity_id = ?1"),
        params![entity_id],
        row_to_score,
    )
    .await
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl FeedbackStore for LibSqlBackend {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        let gate = self.lock_gate().await?;

        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("begin: {e}")))?;

        Ok(Box::new(LibSqlTransaction {
            conn: self.conn.clone(),
            _gate: gate,
        }))
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>, DatabaseError> {
        let _gate = self.lock_gate().await?;
        query_one(
            &self.conn,
            "get_entity",
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
            params![entity_id],
            row_to_entity,
        )
        .await
    }

    async fn get_entity_score(
        &self,
        entity_id: &str,
    ) -> Result<Option<EntityScore>, DatabaseError> {
        let _gate = self.lock_gate().await?;
        select_entity_score(&self.conn, entity_id).await
    }

    async fn list_entity_scores(&self, limit: usize) -> Result<Vec<EntityScore>, DatabaseError> {
        let _gate = self.lock_gate().await?;
        query_all(
            &self.conn,
            "list_entity_scores",
            &format!(
                "SELECT {SCORE_COLUMNS} FROM entity_scores
                 ORDER BY average_score ASC, entity_id ASC LIMIT ?1"
            ),
            params![limit as i64],
            row_to_score,
        )
        .await
    }

    async fn list_feedback_for_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<FeedbackRecord>, DatabaseError> {
        let _gate = self.lock_gate().await?;
        query_all(
            &self.conn,
            "list_feedback_for_entity",
            &format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback WHERE entity_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ),
            params![entity_id, limit as i64],
            row_to_feedback,
        )
        .await
    }

    async fn list_alerts_for_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<AlertRecord>, DatabaseError> {
        let _gate = self.lock_gate().await?;
        query_all(
            &self.conn,
            "list_alerts_for_entity",
            &format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE entity_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            ),
            params![entity_id, limit as i64],
            row_to_alert,
        )
        .await
    }

    async fn count_feedback(&self) -> Result<i64, DatabaseError> {
        let _gate = self.lock_gate().await?;
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM feedback", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_feedback: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count_feedback: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_feedback: {e}"))),
        }
    }
}

// ── Transaction ─────────────────────────────────────────────────────

/// An open `BEGIN IMMEDIATE` transaction holding the write gate.
///
/// Dropped without commit or rollback, it releases the gate and leaves the
/// SQL transaction open; the next caller to take the gate rolls it back.
struct LibSqlTransaction {
    conn: Connection,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl StoreTransaction for LibSqlTransaction {
    async fn insert_feedback(
        &mut self,
        feedback: &NewFeedback,
    ) -> Result<FeedbackRecord, DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO feedback (submitter_id, entity_type, entity_id, text, sentiment_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    feedback.submitter_id.as_str(),
                    feedback.entity_type.as_str(),
                    feedback.entity_id.as_str(),
                    feedback.text.as_str(),
                    feedback.sentiment_score,
                    fmt_ts(feedback.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_feedback: {e}")))?;

        let id = self.conn.last_insert_rowid();
        debug!(feedback_id = id, entity_id = %feedback.entity_id, "Feedback staged");

        Ok(FeedbackRecord {
            id,
            submitter_id: feedback.submitter_id.clone(),
            entity_type: feedback.entity_type,
            entity_id: feedback.entity_id.clone(),
            text: feedback.text.clone(),
            sentiment_score: feedback.sentiment_score,
            created_at: feedback.created_at,
        })
    }

    async fn ensure_entity(
        &mut self,
        entity_id: &str,
        entity_type: EntityType,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO entities (id, entity_type, name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entity_id,
                    entity_type.as_str(),
                    entity_type.stub_name(entity_id),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_entity: {e}")))?;

        if inserted > 0 {
            debug!(entity_id = %entity_id, entity_type = %entity_type, "Stub entity created");
        }
        Ok(inserted > 0)
    }

    async fn lock_entity_score(
        &mut self,
        entity_id: &str,
    ) -> Result<Option<EntityScore>, DatabaseError> {
        // BEGIN IMMEDIATE already holds the database write lock.
        select_entity_score(&self.conn, entity_id).await
    }

    async fn upsert_entity_score(&mut self, score: &EntityScore) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO entity_scores (entity_id, average_score, observation_count, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (entity_id) DO UPDATE SET
                    average_score = excluded.average_score,
                    observation_count = excluded.observation_count,
                    last_updated = excluded.last_updated",
                params![
                    score.entity_id.as_str(),
                    score.average_score,
                    score.observation_count,
                    fmt_ts(score.last_updated),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_entity_score: {e}")))?;
        Ok(())
    }

    async fn latest_alert_since(
        &mut self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AlertRecord>, DatabaseError> {
        query_one(
            &self.conn,
            "latest_alert_since",
            &format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE entity_id = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC, id DESC LIMIT 1"
            ),
            params![entity_id, fmt_ts(since)],
            row_to_alert,
        )
        .await
    }

    async fn insert_alert(
        &mut self,
        entity_id: &str,
        score_at_alert: f64,
        threshold_at_alert: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<AlertRecord, DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO alerts (entity_id, score_at_alert, threshold_at_alert, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entity_id, score_at_alert, threshold_at_alert, fmt_ts(timestamp)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_alert: {e}")))?;

        Ok(AlertRecord {
            id: self.conn.last_insert_rowid(),
            entity_id: entity_id.to_string(),
            score_at_alert,
            threshold_at_alert,
            timestamp,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            // A failed COMMIT can leave the transaction open.
            if !self.conn.is_autocommit() {
                if let Err(rollback_err) = self.conn.execute("ROLLBACK", ()).await {
                    warn!(error = %rollback_err, "Rollback after failed commit failed");
                }
            }
            return Err(DatabaseError::Transaction(format!("commit: {e}")));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("rollback: {e}")))?;
        Ok(())
    }
}
