//! Seams to the outside world: running callbacks and telling the operator
//! what happened.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::JobFailure;
use crate::job::Job;
use crate::types::Callback;

/// Resolves a stored callback reference and runs it.
///
/// Implementations must be `Send + Sync`: a single executor is shared by
/// every worker in the process.
pub trait Executor: Send + Sync {
    fn invoke(&self, callback: &Callback, parameters: &[Value], job: &Job)
        -> Result<(), JobFailure>;
}

/// Signature of a function registered with [`CallbackRegistry`].
pub type CallbackFn = dyn Fn(&[Value], &Job) -> anyhow::Result<()> + Send + Sync;

/// Executor backed by a name → closure map.
///
/// Lookup uses [`Callback::key`], so `["Mailer", "send"]` resolves the
/// function registered as `"Mailer::send"`.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Arc<CallbackFn>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the function behind `key`.
    pub fn register<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &Job) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = key.into();
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        debug!(callback = %key, "callback registered");
        callbacks.insert(key, Arc::new(f));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value], &Job) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(key, f);
        self
    }

    pub fn contains(&self, callback: &Callback) -> bool {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        callbacks.contains_key(&callback.key())
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = callbacks.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Executor for CallbackRegistry {
    fn invoke(
        &self,
        callback: &Callback,
        parameters: &[Value],
        job: &Job,
    ) -> Result<(), JobFailure> {
        let key = callback.key();
        // Clone the Arc out so the lock is not held while user code runs.
        let f = {
            let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            callbacks.get(&key).cloned()
        };
        let f = f.ok_or(JobFailure::UnknownCallback(key))?;
        f(parameters, job).map_err(JobFailure::Callback)
    }
}

/// Severity of an operator notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Sink for human-readable progress lines during a worker run.
/// Purely observational; nothing the sink does affects control flow.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, level: NotifyLevel);
}

/// Forwards notifications to `tracing` under the `backlog::worker` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Info | NotifyLevel::Success => {
                info!(target: "backlog::worker", "{message}")
            }
            NotifyLevel::Warning => warn!(target: "backlog::worker", "{message}"),
            NotifyLevel::Error => error!(target: "backlog::worker", "{message}"),
        }
    }
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn notify(&self, _message: &str, _level: NotifyLevel) {}
}
