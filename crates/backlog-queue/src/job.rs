use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{JobFailure, Result};
use crate::executor::Executor;
use crate::queue::Queue;
use crate::repeat;
use crate::types::{Callback, Hooks, JobMetadata, Payload};

pub use backlog_core::config::DEFAULT_QUEUE;

/// One unit of deferred work.
///
/// A freshly built job has no metadata. `Queue::push` persists it and
/// `Queue::get_next_job` hands back a reconstructed copy with metadata set;
/// changing a job in memory never touches storage on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    callback: Callback,
    parameters: Vec<Value>,
    scheduled_time: DateTime<Utc>,
    repeat: Option<String>,
    priority: i64,
    hooks: Hooks,
    metadata: Option<JobMetadata>,
}

impl Job {
    /// A job that is due immediately.
    pub fn new(callback: impl Into<Callback>, parameters: Vec<Value>) -> Self {
        Self {
            callback: callback.into(),
            parameters,
            scheduled_time: Utc::now(),
            repeat: None,
            priority: 0,
            hooks: Hooks::default(),
            metadata: None,
        }
    }

    pub(crate) fn from_parts(
        payload: Payload,
        scheduled_time: DateTime<Utc>,
        repeat: Option<String>,
        priority: i64,
        metadata: JobMetadata,
    ) -> Self {
        Self {
            callback: payload.callback,
            parameters: payload.parameters,
            scheduled_time,
            repeat,
            priority,
            hooks: payload.hooks,
            metadata: Some(metadata),
        }
    }

    // --- fluent setters ----------------------------------------------------

    /// Do not run before `time`.
    pub fn schedule(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = time;
        self
    }

    /// Do not run before now + `delay`. A delay past the representable
    /// range saturates, and `Queue::push` rejects the result.
    pub fn delay(self, delay: Duration) -> Self {
        let at = Utc::now().checked_add_signed(delay).unwrap_or(if delay < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });
        self.schedule(at)
    }

    /// Re-enqueue after every successful run. Accepts an interval such as
    /// `"2 hours"` or one of `daily`, `hourly`, `weekly`, `biweekly`,
    /// `monthly`, `quarterly`, `yearly`. Validated when the job is pushed.
    pub fn repeat(mut self, value: &str) -> Self {
        let normalized = repeat::normalize(value);
        self.repeat = (!normalized.is_empty()).then_some(normalized);
        self
    }

    /// Higher priorities are claimed first among due jobs.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    // --- hooks ---------------------------------------------------------------

    /// Runs before the callback. A failing `before` hook fails the job.
    pub fn before(mut self, hook: impl Into<Callback>) -> Self {
        self.hooks.before.push(hook.into());
        self
    }

    /// Runs last, whatever the outcome.
    pub fn after(mut self, hook: impl Into<Callback>) -> Self {
        self.hooks.after.push(hook.into());
        self
    }

    /// Runs when the callback fails, receiving `{"kind", "message"}` as its
    /// only parameter.
    pub fn catch(mut self, hook: impl Into<Callback>) -> Self {
        self.hooks.catch.push(hook.into());
        self
    }

    // --- accessors -----------------------------------------------------------

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn scheduled_time(&self) -> DateTime<Utc> {
        self.scheduled_time
    }

    pub fn repeat_interval(&self) -> Option<&str> {
        self.repeat.as_deref()
    }

    pub fn get_priority(&self) -> i64 {
        self.priority
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn metadata(&self) -> Option<&JobMetadata> {
        self.metadata.as_ref()
    }

    pub fn id(&self) -> Option<i64> {
        self.metadata.as_ref().map(|m| m.id)
    }

    pub fn attempts(&self) -> u32 {
        self.metadata.as_ref().map_or(0, |m| m.attempts)
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.queue.as_str())
    }

    pub fn is_repeated(&self) -> bool {
        self.repeat.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    pub(crate) fn payload(&self) -> Payload {
        Payload {
            callback: self.callback.clone(),
            parameters: self.parameters.clone(),
            hooks: self.hooks.clone(),
        }
    }

    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        if let Some(meta) = self.metadata.as_mut() {
            meta.attempts = attempts;
        }
    }

    // --- execution -----------------------------------------------------------

    /// Run the job: before hooks → callback → catch hooks (on failure) →
    /// after hooks. The failure, if any, is returned after every hook has run.
    pub fn handle(&self, executor: &dyn Executor) -> std::result::Result<(), JobFailure> {
        let outcome = self.run_before_hooks(executor).and_then(|()| {
            debug!(callback = %self.callback, "invoking callback");
            guarded(|| executor.invoke(&self.callback, &self.parameters, self))
        });

        if let Err(ref failure) = outcome {
            let args = [failure.to_json()];
            for hook in &self.hooks.catch {
                if let Err(e) = guarded(|| executor.invoke(hook, &args, self)) {
                    warn!(hook = %hook, error = %e, "catch hook failed");
                }
            }
        }

        for hook in &self.hooks.after {
            if let Err(e) = guarded(|| executor.invoke(hook, &[], self)) {
                warn!(hook = %hook, error = %e, "after hook failed");
            }
        }

        outcome
    }

    fn run_before_hooks(&self, executor: &dyn Executor) -> std::result::Result<(), JobFailure> {
        for hook in &self.hooks.before {
            guarded(|| executor.invoke(hook, &[], self)).map_err(|e| match e {
                JobFailure::Callback(source) => JobFailure::Hook {
                    hook: hook.key(),
                    source,
                },
                other => JobFailure::Hook {
                    hook: hook.key(),
                    source: anyhow::anyhow!(other.to_string()),
                },
            })?;
        }
        Ok(())
    }

    /// Push onto the default queue.
    pub fn dispatch(self, queue: &Queue) -> Result<i64> {
        queue.push(&self, DEFAULT_QUEUE)
    }

    /// Push onto a named queue.
    pub fn dispatch_on(self, queue: &Queue, name: &str) -> Result<i64> {
        queue.push(&self, name)
    }
}

/// Run user code, turning a panic into a `JobFailure::Panicked`.
fn guarded<F>(f: F) -> std::result::Result<(), JobFailure>
where
    F: FnOnce() -> std::result::Result<(), JobFailure>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Err(JobFailure::Panicked(message))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CallbackRegistry;
    use std::sync::{Arc, Mutex};

    /// Registry whose every callback appends its key to a shared trace.
    fn tracing_registry(trace: &Arc<Mutex<Vec<String>>>) -> CallbackRegistry {
        let registry = CallbackRegistry::new();
        for key in ["before_a", "before_b", "work", "after", "on_error"] {
            let trace = Arc::clone(trace);
            registry.register(key, move |_, _| {
                trace.lock().unwrap().push(key.to_string());
                Ok(())
            });
        }
        let t = Arc::clone(trace);
        registry.register("boom", move |_, _| {
            t.lock().unwrap().push("boom".to_string());
            anyhow::bail!("exploded")
        });
        let t = Arc::clone(trace);
        registry.register("panics", move |_, _| {
            t.lock().unwrap().push("panics".to_string());
            panic!("bad index")
        });
        registry
    }

    #[test]
    fn success_runs_hooks_in_order_without_catch() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let registry = tracing_registry(&trace);
        let job = Job::new("work", vec![])
            .before("before_a")
            .before("before_b")
            .catch("on_error")
            .after("after");

        job.handle(&registry).unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["before_a", "before_b", "work", "after"]
        );
    }

    #[test]
    fn failure_fires_catch_then_after_and_propagates() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let registry = tracing_registry(&trace);
        let job = Job::new("boom", vec![]).catch("on_error").after("after");

        let err = job.handle(&registry).unwrap_err();
        assert_eq!(err.kind(), "callback_error");
        assert_eq!(*trace.lock().unwrap(), vec!["boom", "on_error", "after"]);
    }

    #[test]
    fn failure_without_catch_hooks_still_propagates() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let registry = tracing_registry(&trace);
        assert!(Job::new("boom", vec![]).handle(&registry).is_err());
    }

    #[test]
    fn panic_becomes_failure() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let registry = tracing_registry(&trace);
        let job = Job::new("panics", vec![]).after("after");

        let err = job.handle(&registry).unwrap_err();
        assert!(matches!(err, JobFailure::Panicked(ref m) if m == "bad index"));
        assert_eq!(*trace.lock().unwrap(), vec!["panics", "after"]);
    }

    #[test]
    fn failing_before_hook_skips_callback() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let registry = tracing_registry(&trace);
        let job = Job::new("work", vec![])
            .before("boom")
            .catch("on_error")
            .after("after");

        let err = job.handle(&registry).unwrap_err();
        assert_eq!(err.kind(), "hook_error");
        assert_eq!(*trace.lock().unwrap(), vec!["boom", "on_error", "after"]);
    }

    #[test]
    fn catch_hook_receives_failure_description() {
        let seen = Arc::new(Mutex::new(None));
        let registry = CallbackRegistry::new().with("boom", |_, _| anyhow::bail!("disk full"));
        let s = Arc::clone(&seen);
        registry.register("on_error", move |params, _| {
            *s.lock().unwrap() = params.first().cloned();
            Ok(())
        });

        let _ = Job::new("boom", vec![]).catch("on_error").handle(&registry);
        let arg = seen.lock().unwrap().clone().expect("catch hook ran");
        assert_eq!(arg["kind"], "callback_error");
        assert_eq!(arg["message"], "disk full");
    }

    #[test]
    fn repeat_shorthand_and_is_repeated() {
        let job = Job::new("work", vec![]);
        assert!(!job.is_repeated());

        let job = job.repeat("weekly");
        assert!(job.is_repeated());
        assert_eq!(job.repeat_interval(), Some("1 week"));

        assert!(!Job::new("work", vec![]).repeat("   ").is_repeated());
    }

    #[test]
    fn fresh_job_has_no_metadata() {
        let job = Job::new("work", vec![Value::from(1)]).priority(5);
        assert!(job.metadata().is_none());
        assert_eq!(job.id(), None);
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.get_priority(), 5);
        assert!(job.scheduled_time() <= Utc::now());
    }
}
