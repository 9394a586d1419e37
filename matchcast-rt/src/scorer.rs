//! Scorer gateway
//!
//! Launches the external scoring computation for a topic and fans its
//! result out to the topic's subscribers. At most one computation runs per
//! topic; requests arriving while one is running are coalesced into it.
//!
//! Each computation is an explicit task with three outcomes:
//! Succeeded (result broadcast), Failed (logged, nothing broadcast) and
//! TimedOut (process terminated, logged, nothing broadcast). In every case
//! the topic's slot is freed so a later update can score again.

use crate::registry::TopicRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchcast_common::config::ScorerConfig;
use matchcast_common::events::{LiveEvent, ScoreResult};
use matchcast_common::Topic;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest stderr excerpt carried in a failure
const STDERR_EXCERPT_CHARS: usize = 512;

/// Capacity of the completion report channel
const REPORT_CAPACITY: usize = 128;

/// Why a computation produced no result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputationError {
    /// Process could not be started
    #[error("failed to launch scorer: {0}")]
    Launch(String),

    /// Waiting on the process failed
    #[error("scorer I/O failure: {0}")]
    Io(String),

    /// Process exited unsuccessfully (code is None when killed by a signal)
    #[error("scorer exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// Process succeeded but its output is not a valid result
    #[error("malformed scorer output: {0}")]
    MalformedOutput(String),
}

/// State of a computation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

/// Point-in-time view of a computation task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub topic: Topic,
    pub started_at: DateTime<Utc>,
    pub state: TaskState,
}

/// What `request_score` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreRequest {
    /// A new computation was launched
    Started { task_id: Uuid },
    /// A computation was already running for the topic
    Coalesced { task_id: Uuid },
}

impl ScoreRequest {
    pub fn task_id(&self) -> Uuid {
        match self {
            ScoreRequest::Started { task_id } | ScoreRequest::Coalesced { task_id } => *task_id,
        }
    }
}

/// Terminal outcome of a computation
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(ScoreResult),
    Failed(ComputationError),
    TimedOut,
}

/// Outcome category carried in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    TimedOut,
}

/// Emitted once per finished computation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub topic: Topic,
    pub outcome: OutcomeKind,
    pub elapsed_ms: u64,
    /// Failure diagnostic
    pub detail: Option<String>,
}

/// Counter snapshot for the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScorerStats {
    pub started: u64,
    pub coalesced: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub running: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    coalesced: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Runs one scoring computation
///
/// Implementations must be cancel-safe: the gateway drops the future on
/// timeout and expects any external process to be terminated with it.
#[async_trait]
pub trait ScorerRunner: Send + Sync {
    async fn score(&self, topic: &Topic) -> Result<ScoreResult, ComputationError>;
}

/// Scores by running an external command with the topic as its last argument
#[derive(Debug, Clone)]
pub struct ProcessScorer {
    command: String,
    args: Vec<String>,
}

impl ProcessScorer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &ScorerConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl ScorerRunner for ProcessScorer {
    async fn score(&self, topic: &Topic) -> Result<ScoreResult, ComputationError> {
        debug!(
            command = %self.command,
            topic = %topic,
            "Launching scorer process"
        );

        let child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(topic.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ComputationError::Launch(format!("{}: {}", self.command, e)))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ComputationError::Io(e.to_string()))?;

        if !output.status.success() {
            return Err(ComputationError::NonZeroExit {
                code: output.status.code(),
                stderr: excerpt(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        parse_score_output(&output.stdout)
    }
}

/// Parse scorer stdout: the last non-empty line must be a result object
pub fn parse_score_output(stdout: &[u8]) -> Result<ScoreResult, ComputationError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| ComputationError::MalformedOutput(format!("not UTF-8: {}", e)))?;

    let line = text
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| ComputationError::MalformedOutput("no output".to_string()))?;

    let result: ScoreResult = serde_json::from_str(line)
        .map_err(|e| ComputationError::MalformedOutput(format!("{}: {}", e, excerpt(line))))?;
    result
        .validate()
        .map_err(ComputationError::MalformedOutput)?;

    Ok(result)
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(STDERR_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Coalescing gateway in front of a [`ScorerRunner`]
pub struct ScorerGateway {
    runner: Arc<dyn ScorerRunner>,
    registry: Arc<TopicRegistry>,
    timeout: Duration,
    tasks: Mutex<HashMap<Topic, TaskSnapshot>>,
    counters: Counters,
    reports: broadcast::Sender<TaskReport>,
}

impl ScorerGateway {
    pub fn new(
        runner: Arc<dyn ScorerRunner>,
        registry: Arc<TopicRegistry>,
        timeout: Duration,
    ) -> Arc<Self> {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        info!("Scorer gateway initialized (timeout {:?})", timeout);
        Arc::new(Self {
            runner,
            registry,
            timeout,
            tasks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            reports,
        })
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<Topic, TaskSnapshot>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch scoring for a topic unless a computation is already running
    ///
    /// Never waits for the computation; completion is observed through
    /// [`subscribe_reports`](Self::subscribe_reports).
    pub fn request_score(self: &Arc<Self>, topic: &Topic) -> ScoreRequest {
        let task_id = {
            let mut tasks = self.lock_tasks();
            if let Some(existing) = tasks.get(topic) {
                if existing.state == TaskState::Running {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        topic = %topic,
                        task_id = %existing.task_id,
                        "Score request coalesced into running task"
                    );
                    return ScoreRequest::Coalesced {
                        task_id: existing.task_id,
                    };
                }
            }

            let task_id = Uuid::new_v4();
            tasks.insert(
                topic.clone(),
                TaskSnapshot {
                    task_id,
                    topic: topic.clone(),
                    started_at: matchcast_common::time::now(),
                    state: TaskState::Running,
                },
            );
            task_id
        };

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(topic = %topic, task_id = %task_id, "Scoring task started");

        let slot = TaskSlot {
            gateway: Arc::clone(self),
            topic: topic.clone(),
            task_id,
            started: Instant::now(),
            armed: true,
        };
        tokio::spawn(slot.run());

        ScoreRequest::Started { task_id }
    }

    /// Task currently registered for a topic
    pub fn in_flight(&self, topic: &Topic) -> Option<TaskSnapshot> {
        self.lock_tasks().get(topic).cloned()
    }

    /// Number of running computations
    pub fn running_count(&self) -> usize {
        self.lock_tasks()
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count()
    }

    /// Completion reports for every finished computation
    pub fn subscribe_reports(&self) -> broadcast::Receiver<TaskReport> {
        self.reports.subscribe()
    }

    pub fn stats(&self) -> ScorerStats {
        ScorerStats {
            started: self.counters.started.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            running: self.running_count() as u64,
        }
    }

    fn set_state(&self, topic: &Topic, task_id: Uuid, state: TaskState) {
        if let Some(task) = self.lock_tasks().get_mut(topic) {
            if task.task_id == task_id {
                task.state = state;
            }
        }
    }

    /// Free the topic's slot if it still belongs to `task_id`
    fn discard(&self, topic: &Topic, task_id: Uuid) {
        let mut tasks = self.lock_tasks();
        if tasks.get(topic).is_some_and(|t| t.task_id == task_id) {
            tasks.remove(topic);
        }
    }

    fn complete(&self, topic: &Topic, task_id: Uuid, outcome: TaskOutcome, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;

        let (kind, detail) = match outcome {
            TaskOutcome::Succeeded(result) => {
                self.set_state(topic, task_id, TaskState::Succeeded);
                info!(
                    topic = %topic,
                    task_id = %task_id,
                    outcome = %result.outcome,
                    confidence = result.confidence,
                    elapsed_ms,
                    "Scoring task succeeded"
                );
                let report = self.registry.broadcast(
                    topic,
                    LiveEvent::score_result(topic.clone(), task_id, result),
                );
                debug!(topic = %topic, delivered = report.delivered, "Score result delivered");
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                (OutcomeKind::Succeeded, None)
            }
            TaskOutcome::Failed(e) => {
                self.set_state(topic, task_id, TaskState::Failed);
                error!(
                    topic = %topic,
                    task_id = %task_id,
                    error = %e,
                    elapsed_ms,
                    "Scoring task failed"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                (OutcomeKind::Failed, Some(e.to_string()))
            }
            TaskOutcome::TimedOut => {
                self.set_state(topic, task_id, TaskState::Failed);
                error!(
                    topic = %topic,
                    task_id = %task_id,
                    timeout = ?self.timeout,
                    "Scoring task timed out, process terminated"
                );
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                (
                    OutcomeKind::TimedOut,
                    Some(format!("timed out after {:?}", self.timeout)),
                )
            }
        };

        self.discard(topic, task_id);

        // No listeners is fine
        let _ = self.reports.send(TaskReport {
            task_id,
            topic: topic.clone(),
            outcome: kind,
            elapsed_ms,
            detail,
        });
    }
}

/// Owns a topic's slot for the lifetime of one computation
///
/// If the task is torn down before completing (runtime shutdown, runner
/// panic), dropping the slot still frees the topic.
struct TaskSlot {
    gateway: Arc<ScorerGateway>,
    topic: Topic,
    task_id: Uuid,
    started: Instant,
    armed: bool,
}

impl TaskSlot {
    async fn run(mut self) {
        let gateway = Arc::clone(&self.gateway);
        let outcome =
            match tokio::time::timeout(gateway.timeout, gateway.runner.score(&self.topic)).await {
                Ok(Ok(result)) => TaskOutcome::Succeeded(result),
                Ok(Err(e)) => TaskOutcome::Failed(e),
                Err(_) => TaskOutcome::TimedOut,
            };

        self.armed = false;
        gateway.complete(&self.topic, self.task_id, outcome, self.started.elapsed());
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                topic = %self.topic,
                task_id = %self.task_id,
                "Scoring task aborted before completion"
            );
            self.gateway.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.gateway.discard(&self.topic, self.task_id);
        }
    }
}
