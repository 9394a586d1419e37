//! Maintenance scheduler
//!
//! Fires the retraining job on a calendar expression, independent of client
//! activity. A firing that finds the previous run still active is skipped
//! and logged; two retraining runs never overlap.

use chrono::{DateTime, Utc};
use matchcast_common::config::MaintenanceConfig;
pub use matchcast_common::schedule::{CalendarSchedule, ScheduleError};
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External retraining command
#[derive(Debug, Clone)]
pub struct RetrainJob {
    command: String,
    args: Vec<String>,
}

impl RetrainJob {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Run to completion, streaming output lines to the log
    pub async fn run(&self) -> RunRecord {
        let started_at = matchcast_common::time::now();

        let mut child = match tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return RunRecord {
                    started_at,
                    finished_at: matchcast_common::time::now(),
                    exit_code: None,
                    success: false,
                    error: Some(format!("failed to launch {}: {}", self.command, e)),
                }
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, _, status) = tokio::join!(
            stream_lines(stdout, false),
            stream_lines(stderr, true),
            child.wait()
        );

        let finished_at = matchcast_common::time::now();
        match status {
            Ok(status) => RunRecord {
                started_at,
                finished_at,
                exit_code: status.code(),
                success: status.success(),
                error: None,
            },
            Err(e) => RunRecord {
                started_at,
                finished_at,
                exit_code: None,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

async fn stream_lines<R: AsyncRead + Unpin>(reader: Option<R>, is_stderr: bool) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!("Model retraining: {}", line);
                } else {
                    info!("Model retraining: {}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Model retraining output unreadable: {}", e);
                break;
            }
        }
    }
}

/// Outcome of one retraining run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// None when the process could not start or was killed by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub error: Option<String>,
}

/// What a firing did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOutcome {
    Started,
    /// Previous run still active
    Skipped,
}

/// Scheduler state for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub schedule: String,
    pub running: bool,
    pub next_fire: Option<DateTime<Utc>>,
    pub runs: u64,
    pub skipped: u64,
    pub last_run: Option<RunRecord>,
}

/// Recurring retraining trigger
pub struct MaintenanceScheduler {
    schedule: CalendarSchedule,
    job: RetrainJob,
    running: AtomicBool,
    runs: AtomicU64,
    skipped: AtomicU64,
    last_run: Mutex<Option<RunRecord>>,
}

impl MaintenanceScheduler {
    pub fn new(schedule: CalendarSchedule, job: RetrainJob) -> Arc<Self> {
        Arc::new(Self {
            schedule,
            job,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_run: Mutex::new(None),
        })
    }

    pub fn from_config(config: &MaintenanceConfig) -> Result<Arc<Self>, ScheduleError> {
        let schedule = CalendarSchedule::parse(&config.schedule)?;
        Ok(Self::new(
            schedule,
            RetrainJob::new(config.command.clone(), config.args.clone()),
        ))
    }

    pub fn schedule(&self) -> &CalendarSchedule {
        &self.schedule
    }

    /// Start the retraining job unless the previous run is still active
    ///
    /// Returns immediately; the run proceeds in the background.
    pub fn fire(self: &Arc<Self>) -> FireOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                skipped_total = skipped,
                "Model retraining still running, skipping this firing"
            );
            return FireOutcome::Skipped;
        }

        info!("Running scheduled model retraining");
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let _running = RunningFlag(&scheduler.running);
            let record = scheduler.job.run().await;

            if record.success {
                info!(exit_code = ?record.exit_code, "Model retraining completed");
            } else {
                error!(
                    exit_code = ?record.exit_code,
                    error = record.error.as_deref().unwrap_or(""),
                    "Model retraining failed"
                );
            }

            scheduler.runs.fetch_add(1, Ordering::Relaxed);
            *scheduler
                .last_run
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(record);
        });

        FireOutcome::Started
    }

    /// Spawn the tick loop; it exits when `shutdown` is cancelled
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_loop(shutdown).await })
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            schedule = self.schedule.expression(),
            "Maintenance scheduler started"
        );

        let mut previous: Option<DateTime<Utc>> = None;
        loop {
            let now = matchcast_common::time::now();
            // Never fire the same tick twice if the wall clock lags the timer
            let from = previous.map_or(now, |p| p.max(now));
            let Some(next) = self.schedule.next_after(from) else {
                warn!(
                    schedule = self.schedule.expression(),
                    "Schedule has no future firings, scheduler stopping"
                );
                return;
            };

            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_fire = %next, "Next model retraining scheduled");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Maintenance scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {
                    previous = Some(next);
                    self.fire();
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_run(&self) -> Option<RunRecord> {
        self.last_run
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            schedule: self.schedule.expression().to_string(),
            running: self.is_running(),
            next_fire: self.schedule.next_after(matchcast_common::time::now()),
            runs: self.runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_run: self.last_run(),
        }
    }
}

/// Clears the running flag when the run task ends, however it ends
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
