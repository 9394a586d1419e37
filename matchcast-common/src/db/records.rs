//! Record store: one persisted record per topic
//!
//! Writes are upserts keyed by topic. The caller learns from the result
//! whether the record was created by this write or already existed.

use crate::topic::Topic;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::debug;

/// Optimistic update attempts before reporting a write conflict
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// True when this write created the record
    pub created: bool,
    /// Record revision after the write (1 for a new record)
    pub revision: i64,
}

/// Persistent record store collaborator
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert the record, or set the payload's fields on the existing one
    ///
    /// `payload` must be a JSON object. Fields present in `payload` replace
    /// the stored values; other stored fields are kept.
    async fn upsert(&self, topic: &Topic, payload: &Value) -> Result<UpsertOutcome>;

    /// Current record for a topic
    async fn find_one(&self, topic: &Topic) -> Result<Option<Value>>;
}

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn try_insert(&self, topic: &Topic, payload: &Map<String, Value>) -> Result<bool> {
        let now = crate::time::now();
        let result = sqlx::query(
            r#"
            INSERT INTO records (topic, payload, revision, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(topic) DO NOTHING
            "#,
        )
        .bind(topic.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Merge into the stored record, guarded by its revision
    async fn try_merge(
        &self,
        topic: &Topic,
        payload: &Map<String, Value>,
    ) -> Result<Option<i64>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT payload, revision FROM records WHERE topic = ?")
                .bind(topic.as_str())
                .fetch_optional(&self.pool)
                .await?;

        let Some((stored, revision)) = row else {
            return Err(Error::WriteConflict(format!(
                "record for {} vanished during upsert",
                topic
            )));
        };

        let mut merged = match serde_json::from_str::<Value>(&stored)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in payload {
            merged.insert(key.clone(), value.clone());
        }

        let result = sqlx::query(
            "UPDATE records SET payload = ?, revision = ?, updated_at = ? WHERE topic = ? AND revision = ?",
        )
        .bind(serde_json::to_string(&merged)?)
        .bind(revision + 1)
        .bind(crate::time::now())
        .bind(topic.as_str())
        .bind(revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(revision + 1))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert(&self, topic: &Topic, payload: &Value) -> Result<UpsertOutcome> {
        let Value::Object(fields) = payload else {
            return Err(Error::InvalidInput(
                "update payload must be a JSON object".to_string(),
            ));
        };

        if self.try_insert(topic, fields).await? {
            debug!(topic = %topic, "Record created");
            return Ok(UpsertOutcome {
                created: true,
                revision: 1,
            });
        }

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            if let Some(revision) = self.try_merge(topic, fields).await? {
                debug!(topic = %topic, revision, "Record updated");
                return Ok(UpsertOutcome {
                    created: false,
                    revision,
                });
            }
            debug!(topic = %topic, attempt, "Concurrent record update, retrying");
        }

        Err(Error::WriteConflict(format!(
            "record for {} changed concurrently {} times",
            topic, MAX_UPDATE_ATTEMPTS
        )))
    }

    async fn find_one(&self, topic: &Topic) -> Result<Option<Value>> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT payload FROM records WHERE topic = ?")
                .bind(topic.as_str())
                .fetch_optional(&self.pool)
                .await?;

        stored
            .map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }
}
