use thiserror::Error;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error (locked, unwritable, corrupt file, ...).
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A claimed row whose payload could not be decoded. The row has already
    /// been archived to `failed_jobs` when this is returned.
    #[error("Malformed payload for job {id}: {reason}")]
    MalformedPayload { id: i64, reason: String },

    /// The repeat expression could not be parsed into an interval.
    #[error("Invalid repeat interval: {0}")]
    InvalidRepeat(String),

    /// The scheduled time falls outside the range the store can order.
    #[error("Invalid schedule time: {0}")]
    InvalidSchedule(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: i64 },

    /// The row is no longer in the state this caller left it in, usually
    /// because stale recovery handed it to another worker.
    #[error("Job {id} is no longer held by this worker")]
    LostClaim { id: i64 },

    /// The operation needs a job that came out of the store.
    #[error("Job has not been pushed to a queue")]
    NotPersisted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Why a single job execution failed. Recovered by the worker loop and
/// turned into a retry or an archive entry; never escapes `work`.
#[derive(Debug, Error)]
pub enum JobFailure {
    /// The callback returned an error.
    #[error("{0}")]
    Callback(#[source] anyhow::Error),

    /// The executor has nothing registered under this callback reference.
    #[error("no callback registered for `{0}`")]
    UnknownCallback(String),

    /// The callback panicked; the payload is the panic message when available.
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// A `before` hook failed, so the callback never ran.
    #[error("before hook `{hook}` failed: {source}")]
    Hook {
        hook: String,
        #[source]
        source: anyhow::Error,
    },

    /// The stored payload could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl JobFailure {
    /// Stable identifier of the failure class, stored as the exception type.
    pub fn kind(&self) -> &'static str {
        match self {
            JobFailure::Callback(_) => "callback_error",
            JobFailure::UnknownCallback(_) => "unknown_callback",
            JobFailure::Panicked(_) => "panic",
            JobFailure::Hook { .. } => "hook_error",
            JobFailure::MalformedPayload(_) => "malformed_payload",
        }
    }

    /// Text persisted in `failed_jobs.exception`: `kind: message` on the first
    /// line followed by the full cause chain.
    pub fn exception_text(&self) -> String {
        let trace = match self {
            JobFailure::Callback(e) | JobFailure::Hook { source: e, .. } => format!("{e:?}"),
            _ => String::new(),
        };
        if trace.is_empty() {
            format!("{}: {}", self.kind(), self)
        } else {
            format!("{}: {}\n{}", self.kind(), self, trace)
        }
    }

    /// JSON shape handed to `catch` hooks.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": self.kind(), "message": self.to_string() })
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(e: anyhow::Error) -> Self {
        JobFailure::Callback(e)
    }
}
