use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backlog_core::config::{LogConfig, WorkerConfig, DEFAULT_LOG_MAX_BYTES};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::error::{JobFailure, QueueError, Result};
use crate::executor::{Executor, Notifier, NotifyLevel, TracingNotifier};
use crate::job::{Job, DEFAULT_QUEUE};
use crate::logfile::SummaryLog;
use crate::queue::{Completion, Queue};

/// Tunables for one `Worker::work` run.
#[derive(Debug, Clone)]
pub struct WorkOptions {
    /// Handle at most one job, then return. An empty poll also returns.
    pub once: bool,
    /// Wall-clock budget. Checked between jobs; a running job is never interrupted.
    pub timeout: Duration,
    /// Idle delay after an empty poll.
    pub sleep: Duration,
    /// How far ahead a failed-but-retryable job is rescheduled.
    pub delay: Duration,
    /// Attempts before a job is archived as permanently failed.
    pub tries: u32,
    pub queues: Vec<String>,
    /// Reservations older than this are released at startup.
    pub stale_after: Duration,
    /// Summary log; `None` disables it.
    pub log_path: Option<PathBuf>,
    pub log_max_bytes: u64,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkOptions {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            once: false,
            timeout: Duration::from_secs(cfg.timeout_secs),
            sleep: Duration::from_secs(cfg.sleep_secs),
            delay: Duration::from_secs(cfg.delay_secs),
            tries: cfg.tries,
            queues: cfg.queues.clone(),
            stale_after: Duration::from_secs(cfg.stale_after_secs),
            log_path: None,
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
        }
    }
}

impl WorkOptions {
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        if self.queues.is_empty() {
            self.queues.push(DEFAULT_QUEUE.to_string());
        }
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn log(mut self, cfg: &LogConfig) -> Self {
        self.log_path = cfg.enabled.then(|| PathBuf::from(&cfg.path));
        self.log_max_bytes = cfg.max_bytes;
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn without_log(mut self) -> Self {
        self.log_path = None;
        self
    }
}

/// Counters for one `work` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    /// Jobs claimed.
    pub processed: u64,
    pub succeeded: u64,
    /// Failed executions, retried or archived.
    pub failed: u64,
    pub retried: u64,
    pub archived: u64,
    /// Store operations that errored during the run.
    pub storage_errors: u64,
}

impl WorkSummary {
    pub fn line(&self) -> String {
        format!(
            "Processed {} job(s): {} succeeded, {} failed ({} retrying, {} archived), {} storage error(s)",
            self.processed, self.succeeded, self.failed, self.retried, self.archived, self.storage_errors
        )
    }
}

/// Polls a `Queue`, runs claimed jobs through an `Executor` and applies the
/// retry / repeat / archive policy.
///
/// A worker runs one job at a time; run several workers (each with its own
/// `Queue` connection) for parallelism.
pub struct Worker {
    id: Uuid,
    queue: Arc<Queue>,
    executor: Arc<dyn Executor>,
    notifier: Arc<dyn Notifier>,
}

impl Worker {
    pub fn new(queue: Arc<Queue>, executor: Arc<dyn Executor>) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue,
            executor,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the worker loop until `timeout` elapses (or after one job when `once`).
    ///
    /// Only the startup stale-reservation sweep can fail the call. Job
    /// failures become state transitions and storage errors inside the loop
    /// are logged, counted and retried on the next tick.
    #[instrument(skip_all, fields(worker.id = %self.id))]
    pub async fn work(&self, options: &WorkOptions) -> Result<WorkSummary> {
        let recovered = self.queue.recover_stale_jobs(options.stale_after)?;
        if recovered > 0 {
            self.notify(
                &format!("Released {recovered} stale reservation(s)"),
                NotifyLevel::Warning,
            );
        }

        let started = Instant::now();
        let mut summary = WorkSummary::default();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= options.timeout {
                debug!("worker timeout reached");
                break;
            }

            let idle = match self.queue.get_next_job(options.queues.as_slice()) {
                Ok(Some(job)) => {
                    self.process(job, options, &mut summary);
                    false
                }
                Ok(None) => true,
                Err(QueueError::MalformedPayload { id, reason }) => {
                    summary.processed += 1;
                    summary.failed += 1;
                    summary.archived += 1;
                    self.notify(
                        &format!("Job #{id} has a malformed payload and was archived: {reason}"),
                        NotifyLevel::Error,
                    );
                    false
                }
                Err(e) => {
                    summary.storage_errors += 1;
                    error!(error = %e, "failed to claim next job");
                    self.notify(&format!("Could not poll for jobs: {e}"), NotifyLevel::Error);
                    true
                }
            };

            if options.once {
                break;
            }
            if idle {
                let remaining = options.timeout.saturating_sub(started.elapsed());
                tokio::time::sleep(options.sleep.min(remaining)).await;
            }
        }

        self.finish(&summary, options);
        Ok(summary)
    }

    fn process(&self, mut job: Job, options: &WorkOptions, summary: &mut WorkSummary) {
        let Some(id) = job.id() else {
            return;
        };
        summary.processed += 1;
        self.notify(
            &format!("Processing job #{id} ({})", job.callback()),
            NotifyLevel::Info,
        );

        let attempts = match self.queue.mark_processing(id) {
            Ok(attempts) => attempts,
            Err(e) => {
                self.storage_error(id, "mark job as processing", &e, summary);
                return;
            }
        };
        job.set_attempts(attempts);

        match job.handle(self.executor.as_ref()) {
            Ok(()) => {
                summary.succeeded += 1;
                self.record_success(&job, id, summary);
            }
            Err(failure) => {
                summary.failed += 1;
                self.record_failure(id, attempts, &failure, options, summary);
            }
        }
    }

    fn record_success(&self, job: &Job, id: i64, summary: &mut WorkSummary) {
        match self.queue.complete(job) {
            Ok(Completion::Deleted) => {
                self.notify(&format!("Job #{id} completed"), NotifyLevel::Success);
            }
            Ok(Completion::Rescheduled(next)) => {
                self.notify(
                    &format!("Job #{id} completed, next run at {}", next.to_rfc3339()),
                    NotifyLevel::Success,
                );
            }
            Err(QueueError::InvalidRepeat(expr)) => {
                // Only reachable if the row was edited by hand after push.
                let text = format!("invalid_repeat: cannot reschedule with `{expr}`");
                match self.queue.archive_failure(id, job.attempts(), &text) {
                    Ok(()) => {
                        summary.archived += 1;
                        self.notify(
                            &format!("Job #{id} has an invalid repeat interval `{expr}` and was archived"),
                            NotifyLevel::Error,
                        );
                    }
                    Err(e) => self.storage_error(id, "archive job", &e, summary),
                }
            }
            Err(e) => self.storage_error(id, "record success", &e, summary),
        }
    }

    fn record_failure(
        &self,
        id: i64,
        attempts: u32,
        failure: &JobFailure,
        options: &WorkOptions,
        summary: &mut WorkSummary,
    ) {
        warn!(job_id = id, attempts, kind = failure.kind(), error = %failure, "job failed");

        if attempts >= options.tries {
            match self.queue.archive_failure(id, attempts, &failure.exception_text()) {
                Ok(()) => {
                    summary.archived += 1;
                    self.notify(
                        &format!("Job #{id} failed permanently after {attempts} attempt(s): {failure}"),
                        NotifyLevel::Error,
                    );
                }
                Err(e) => self.storage_error(id, "archive job", &e, summary),
            }
            return;
        }

        match self.queue.release_for_retry(id, attempts, options.delay) {
            Ok(next) => {
                summary.retried += 1;
                self.notify(
                    &format!(
                        "Job #{id} failed (attempt {attempts}/{}): {failure}; retrying at {}",
                        options.tries,
                        next.to_rfc3339()
                    ),
                    NotifyLevel::Warning,
                );
            }
            Err(e) => self.storage_error(id, "reschedule job", &e, summary),
        }
    }

    /// The row stays reserved/processing; stale recovery will hand it out again.
    fn storage_error(&self, id: i64, action: &str, e: &QueueError, summary: &mut WorkSummary) {
        summary.storage_errors += 1;
        error!(job_id = id, error = %e, "failed to {action}");
        self.notify(&format!("Job #{id}: failed to {action}: {e}"), NotifyLevel::Error);
    }

    fn finish(&self, summary: &WorkSummary, options: &WorkOptions) {
        let line = summary.line();
        self.notify(&line, NotifyLevel::Info);

        if let Some(ref path) = options.log_path {
            let log = SummaryLog::new(path, options.log_max_bytes);
            if let Err(e) = log.append(&format!("worker {} {line}", self.id)) {
                warn!(path = %path.display(), error = %e, "could not write worker log");
            }
        }
    }

    fn notify(&self, message: &str, level: NotifyLevel) {
        self.notifier.notify(message, level);
    }
}
