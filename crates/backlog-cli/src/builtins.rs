//! Callbacks every `backlog work` process can run out of the box.

use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use backlog_queue::{CallbackRegistry, Job};
use serde_json::Value;
use tracing::info;

pub fn registry() -> CallbackRegistry {
    CallbackRegistry::new()
        .with("log", log)
        .with("sleep", sleep)
        .with("fail", fail)
        .with("command", command)
}

fn log(params: &[Value], job: &Job) -> anyhow::Result<()> {
    let rendered: Vec<String> = params.iter().map(render).collect();
    info!(job_id = ?job.id(), "{}", rendered.join(" "));
    Ok(())
}

/// `sleep <seconds>`; fractional seconds are fine.
fn sleep(params: &[Value], _job: &Job) -> anyhow::Result<()> {
    let secs = params
        .first()
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("sleep expects a number of seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        bail!("sleep expects a non-negative number of seconds, got {secs}");
    }
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(())
}

fn fail(params: &[Value], _job: &Job) -> anyhow::Result<()> {
    match params.first() {
        Some(reason) => bail!("{}", render(reason)),
        None => bail!("job failed on purpose"),
    }
}

/// `command <program> [args...]`. A non-zero exit status is a failure.
fn command(params: &[Value], job: &Job) -> anyhow::Result<()> {
    let (program, args) = params
        .split_first()
        .ok_or_else(|| anyhow!("command expects a program name"))?;
    let program = render(program);
    let args: Vec<String> = args.iter().map(render).collect();

    let output = Command::new(&program)
        .args(&args)
        .output()
        .with_context(|| format!("failed to start `{program}`"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{program}` exited with {}: {}", output.status, stderr.trim());
    }
    info!(job_id = ?job.id(), %program, "command finished");
    Ok(())
}

/// Strings without their JSON quotes, everything else as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_queue::{Callback, Executor};
    use serde_json::json;

    fn run(name: &str, params: Vec<Value>) -> Result<(), backlog_queue::JobFailure> {
        let job = Job::new(name, params.clone());
        registry().invoke(&Callback::name(name), &params, &job)
    }

    #[test]
    fn all_builtins_registered() {
        assert_eq!(registry().keys(), vec!["command", "fail", "log", "sleep"]);
    }

    #[test]
    fn log_and_sleep_succeed() {
        assert!(run("log", vec![json!("hello"), json!({"n": 1})]).is_ok());
        assert!(run("sleep", vec![json!(0.01)]).is_ok());
    }

    #[test]
    fn sleep_rejects_bad_arguments() {
        assert!(run("sleep", vec![]).is_err());
        assert!(run("sleep", vec![json!("soon")]).is_err());
        assert!(run("sleep", vec![json!(-1)]).is_err());
    }

    #[test]
    fn fail_uses_given_reason() {
        let err = run("fail", vec![json!("drill")]).unwrap_err();
        assert_eq!(err.to_string(), "drill");
        assert_eq!(err.kind(), "callback_error");
    }

    #[cfg(unix)]
    #[test]
    fn command_reports_exit_status() {
        assert!(run("command", vec![json!("true")]).is_ok());
        assert!(run("command", vec![json!("false")]).is_err());
        assert!(run("command", vec![json!("sh"), json!("-c"), json!("exit 0")]).is_ok());
        assert!(run("command", vec![]).is_err());
    }

    #[test]
    fn render_strips_string_quotes() {
        assert_eq!(render(&json!("plain")), "plain");
        assert_eq!(render(&json!([1, 2])), "[1,2]");
    }
}
