//! `backlog-queue` — persistent at-least-once job queue on SQLite.
//!
//! # Overview
//!
//! A [`Job`] names a callback plus JSON parameters. [`Queue::push`] stores it
//! in the `jobs` table; a [`Worker`] claims due jobs with
//! [`Queue::get_next_job`], runs them through an [`Executor`] and applies the
//! retry / repeat / archive policy. Jobs whose retry budget runs out are
//! copied to `failed_jobs` for inspection and manual retry.
//!
//! # Job states
//!
//! | Status       | Meaning                                              |
//! |--------------|------------------------------------------------------|
//! | `pending`    | Waiting for `scheduled_time` and a free worker       |
//! | `reserved`   | Claimed by a worker, not yet executing               |
//! | `processing` | Executing; `attempts` already incremented            |
//! | `failed`     | Out of retries; an archive row exists                |
//!
//! A crashed worker leaves rows in `reserved`/`processing`; the next worker to
//! start releases any reservation older than `stale_after` back to `pending`.

pub mod db;
pub mod error;
pub mod executor;
pub mod job;
pub mod logfile;
pub mod queue;
pub mod repeat;
pub mod types;
pub mod worker;

pub use error::{JobFailure, QueueError, Result};
pub use executor::{
    CallbackRegistry, Executor, Notifier, NotifyLevel, SilentNotifier, TracingNotifier,
};
pub use job::{Job, DEFAULT_QUEUE};
pub use logfile::SummaryLog;
pub use queue::{Completion, Queue};
pub use types::{Callback, FailedJobRecord, Hooks, JobFilter, JobRecord, JobStatus, QueueStats};
pub use worker::{WorkOptions, WorkSummary, Worker};
