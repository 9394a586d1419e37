//! Event types for the matchcast wire protocol
//!
//! Outbound events ([`LiveEvent`]) are pushed to connected clients as JSON
//! text frames; inbound messages ([`ClientMessage`]) arrive on the same
//! connection.

use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Structured result produced by the external scorer
///
/// `outcome` and `confidence` are required; any further fields the scorer
/// emits are kept in `extra` and forwarded to subscribers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Predicted outcome label (e.g. "home", "away", "draw")
    pub outcome: String,
    /// Scorer confidence in [0.0, 1.0]
    pub confidence: f64,
    /// Additional scorer fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScoreResult {
    pub fn new(outcome: impl Into<String>, confidence: f64) -> Self {
        Self {
            outcome: outcome.into(),
            confidence,
            extra: Map::new(),
        }
    }

    /// Check the fields a subscriber relies on
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.outcome.trim().is_empty() {
            return Err("outcome is empty".to_string());
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        Ok(())
    }
}

/// Events pushed to subscribers
///
/// Serialized with an `event` tag: `update`, `scoreResult`, `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LiveEvent {
    /// Raw update for a topic
    ///
    /// Triggers:
    /// - Emitted once per successful ingest, whether the record was created or modified
    Update {
        topic: Topic,
        /// Update fields exactly as ingested
        payload: Value,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Scorer result for a topic
    ///
    /// Triggers:
    /// - Emitted when a scoring task terminates successfully with well-formed output
    ScoreResult {
        topic: Topic,
        /// Task that produced the result
        task_id: Uuid,
        result: ScoreResult,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Rejection of an inbound message, sent only to its sender
    Error { message: String },
}

impl LiveEvent {
    /// Get event type as string for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            LiveEvent::Update { .. } => "update",
            LiveEvent::ScoreResult { .. } => "scoreResult",
            LiveEvent::Error { .. } => "error",
        }
    }

    /// Topic this event belongs to, if any
    pub fn topic(&self) -> Option<&Topic> {
        match self {
            LiveEvent::Update { topic, .. } | LiveEvent::ScoreResult { topic, .. } => Some(topic),
            LiveEvent::Error { .. } => None,
        }
    }

    pub fn update(topic: Topic, payload: Value) -> Self {
        LiveEvent::Update {
            topic,
            payload,
            timestamp: crate::time::now(),
        }
    }

    pub fn score_result(topic: Topic, task_id: Uuid, result: ScoreResult) -> Self {
        LiveEvent::ScoreResult {
            topic,
            task_id,
            result,
            timestamp: crate::time::now(),
        }
    }
}

/// Messages received from clients
///
/// Serialized with a `type` tag: `subscribe`, `unsubscribe`, `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Start receiving events for a topic
    Subscribe { topic: Topic },
    /// Stop receiving events for a topic
    Unsubscribe { topic: Topic },
    /// Producer-side update for a topic (same path as the HTTP ingest endpoint)
    Update { topic: Topic, payload: Value },
}
