//! Update ingestor
//!
//! `ingest` persists an update, always broadcasts it, and requests scoring
//! only when the upsert created the record. A persistence failure aborts the
//! ingest before anything is broadcast.
//!
//! The sequence runs in its own task: a caller that stops waiting (client
//! gone, request dropped) cannot cut it off between the write and the
//! scoring request.

use crate::registry::TopicRegistry;
use crate::scorer::{ScoreRequest, ScorerGateway};
use matchcast_common::db::RecordStore;
use matchcast_common::events::LiveEvent;
use matchcast_common::{Error, Result, Topic};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Scoring decision taken by one ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringDecision {
    /// Record already existed; scoring not requested
    NotRequested,
    /// New record; a computation was launched
    Started,
    /// New record; joined a computation already running for the topic
    Coalesced,
}

impl From<ScoreRequest> for ScoringDecision {
    fn from(request: ScoreRequest) -> Self {
        match request {
            ScoreRequest::Started { .. } => ScoringDecision::Started,
            ScoreRequest::Coalesced { .. } => ScoringDecision::Coalesced,
        }
    }
}

/// Result of a successful ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// The upsert created the record
    pub created: bool,
    /// Record revision after the write
    pub revision: i64,
    /// Subscribers that accepted the update
    pub delivered: usize,
    pub scoring: ScoringDecision,
}

/// Per-topic async locks keeping same-topic ingests in completion order
#[derive(Default)]
struct TopicLocks {
    locks: Mutex<HashMap<Topic, Arc<tokio::sync::Mutex<()>>>>,
}

impl TopicLocks {
    fn get(&self, topic: &Topic) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(topic.clone()).or_default())
    }

    /// Drop the topic's lock once no ingest holds or awaits it
    fn release(&self, topic: &Topic, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        drop(lock);
        if locks.get(topic).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(topic);
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Persist → broadcast → (maybe) score
pub struct UpdateIngestor {
    store: Arc<dyn RecordStore>,
    registry: Arc<TopicRegistry>,
    scorer: Arc<ScorerGateway>,
    ordering: TopicLocks,
}

impl UpdateIngestor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<TopicRegistry>,
        scorer: Arc<ScorerGateway>,
    ) -> Self {
        Self {
            store,
            registry,
            scorer,
            ordering: TopicLocks::default(),
        }
    }

    /// Ingest one update for a topic
    ///
    /// Same-topic ingests are serialized from upsert through broadcast;
    /// other topics are not held up. Dropping the returned future does not
    /// abandon an ingest already under way.
    pub async fn ingest(self: &Arc<Self>, topic: &Topic, payload: Value) -> Result<IngestOutcome> {
        if !payload.is_object() {
            return Err(Error::InvalidInput(
                "update payload must be a JSON object".to_string(),
            ));
        }

        let ingestor = Arc::clone(self);
        let topic = topic.clone();
        tokio::spawn(async move { ingestor.run_ingest(&topic, payload).await })
            .await
            .map_err(|e| Error::Internal(format!("ingest task failed: {}", e)))?
    }

    async fn run_ingest(&self, topic: &Topic, payload: Value) -> Result<IngestOutcome> {
        let lock = self.ordering.get(topic);
        let result = {
            let _ordered = lock.lock().await;
            self.persist_and_broadcast(topic, payload).await
        };
        self.ordering.release(topic, lock);

        let (created, revision, delivered) = result?;

        // Explicit branch: only a newly created record is scored
        let scoring: ScoringDecision = if created {
            self.scorer.request_score(topic).into()
        } else {
            ScoringDecision::NotRequested
        };

        debug!(
            topic = %topic,
            created,
            revision,
            delivered,
            scoring = ?scoring,
            "Update ingested"
        );

        Ok(IngestOutcome {
            created,
            revision,
            delivered,
            scoring,
        })
    }

    async fn persist_and_broadcast(
        &self,
        topic: &Topic,
        payload: Value,
    ) -> Result<(bool, i64, usize)> {
        let upsert = self.store.upsert(topic, &payload).await.map_err(|e| {
            error!(topic = %topic, error = %e, "Persisting update failed, ingest aborted");
            e
        })?;

        let report = self
            .registry
            .broadcast(topic, LiveEvent::update(topic.clone(), payload));

        Ok((upsert.created, upsert.revision, report.delivered))
    }

    #[cfg(test)]
    fn pending_topic_locks(&self) -> usize {
        self.ordering.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionHandle;
    use crate::scorer::{ComputationError, ScorerRunner};
    use async_trait::async_trait;
    use matchcast_common::db::{init_memory_database, SqliteRecordStore, UpsertOutcome};
    use matchcast_common::events::ScoreResult;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScorerRunner for CountingRunner {
        async fn score(&self, _topic: &Topic) -> std::result::Result<ScoreResult, ComputationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScoreResult::new("home", 0.8))
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl RecordStore for UnavailableStore {
        async fn upsert(&self, _topic: &Topic, _payload: &Value) -> Result<UpsertOutcome> {
            Err(Error::WriteConflict("store unavailable".to_string()))
        }

        async fn find_one(&self, _topic: &Topic) -> Result<Option<Value>> {
            Ok(None)
        }
    }

    /// Commits the write, then stalls before reporting back
    struct SlowAckStore {
        inner: SqliteRecordStore,
        delay: Duration,
    }

    #[async_trait]
    impl RecordStore for SlowAckStore {
        async fn upsert(&self, topic: &Topic, payload: &Value) -> Result<UpsertOutcome> {
            let outcome = self.inner.upsert(topic, payload).await?;
            tokio::time::sleep(self.delay).await;
            Ok(outcome)
        }

        async fn find_one(&self, topic: &Topic) -> Result<Option<Value>> {
            self.inner.find_one(topic).await
        }
    }

    async fn setup(
        store: Arc<dyn RecordStore>,
    ) -> (Arc<UpdateIngestor>, Arc<TopicRegistry>, Arc<CountingRunner>) {
        let registry = TopicRegistry::shared();
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
        });
        let scorer = ScorerGateway::new(runner.clone(), registry.clone(), Duration::from_secs(5));
        (
            Arc::new(UpdateIngestor::new(store, registry.clone(), scorer)),
            registry,
            runner,
        )
    }

    async fn sqlite_store() -> Arc<dyn RecordStore> {
        Arc::new(SqliteRecordStore::new(init_memory_database().await.unwrap()))
    }

    #[tokio::test]
    async fn test_first_ingest_scores_later_ingests_do_not() {
        let (ingestor, _registry, _runner) = setup(sqlite_store().await).await;

        let first = ingestor.ingest(&topic("M1"), json!({"status": "live"})).await.unwrap();
        let second = ingestor.ingest(&topic("M1"), json!({"score": "1-0"})).await.unwrap();

        assert!(first.created);
        assert_eq!(first.scoring, ScoringDecision::Started);
        assert!(!second.created);
        assert_eq!(second.revision, 2);
        assert_eq!(second.scoring, ScoringDecision::NotRequested);
    }

    #[tokio::test]
    async fn test_every_ingest_broadcasts_once() {
        let (ingestor, registry, _runner) = setup(sqlite_store().await).await;
        let (handle, mut rx) = ConnectionHandle::channel(16);
        registry.subscribe(&topic("M1"), &handle);

        for i in 0..3 {
            let outcome = ingestor.ingest(&topic("M1"), json!({"minute": i})).await.unwrap();
            assert_eq!(outcome.delivered, 1);
        }

        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LiveEvent::Update { payload, .. } = event.as_ref() {
                updates.push(payload["minute"].clone());
            }
        }
        assert_eq!(updates, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_persistence_failure_aborts_without_broadcast() {
        let (ingestor, registry, runner) = setup(Arc::new(UnavailableStore)).await;
        let (handle, mut rx) = ConnectionHandle::channel(16);
        registry.subscribe(&topic("M1"), &handle);

        let result = ingestor.ingest(&topic("M1"), json!({"status": "live"})).await;

        assert!(result.unwrap_err().is_persistence());
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ingestor.pending_topic_locks(), 0);
    }

    #[tokio::test]
    async fn test_non_object_payload_rejected() {
        let (ingestor, _registry, _runner) = setup(sqlite_store().await).await;
        let result = ingestor.ingest(&topic("M1"), json!("live")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_topic_locks_released_after_concurrent_ingests() {
        let (ingestor, _registry, _runner) = setup(sqlite_store().await).await;

        let mut tasks = Vec::new();
        for i in 0..10 {
            let ingestor = Arc::clone(&ingestor);
            tasks.push(tokio::spawn(async move {
                ingestor
                    .ingest(&topic(&format!("T{}", i % 3)), json!({"n": i}))
                    .await
            }));
        }
        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().created {
                created += 1;
            }
        }

        assert_eq!(created, 3);
        assert_eq!(ingestor.pending_topic_locks(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_ingest_still_scores_created_record() {
        let store = Arc::new(SlowAckStore {
            inner: SqliteRecordStore::new(init_memory_database().await.unwrap()),
            delay: Duration::from_millis(200),
        });
        let (ingestor, _registry, runner) = setup(store).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            ingestor.ingest(&topic("M1"), json!({"status": "live"})),
        )
        .await;
        assert!(abandoned.is_err());

        let second = ingestor.ingest(&topic("M1"), json!({"score": "1-0"})).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.scoring, ScoringDecision::NotRequested);

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("created record was scored");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }
}
