use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backlog_core::config::BacklogConfig;
use backlog_queue::{Job, JobFilter, JobStatus, Queue, WorkOptions, Worker};
use clap::{Parser, Subcommand};
use tracing::info;

mod builtins;

#[derive(Parser, Debug)]
#[command(name = "backlog", version, about = "Persistent SQLite job queue")]
struct Cli {
    /// Config file (defaults to $BACKLOG_CONFIG, then ~/.backlog/backlog.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Database file, overriding the configured one
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the queue tables (idempotent)
    Install,

    /// Enqueue a job
    Push {
        /// Callback name, or `Class::method`
        callback: String,
        /// Parameter as JSON; bare words are taken as strings. Repeatable.
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long, default_value = backlog_queue::DEFAULT_QUEUE)]
        queue: String,
        /// Seconds from now before the job becomes due
        #[arg(long, default_value_t = 0)]
        delay: i64,
        /// Repeat interval: a shorthand like `daily` or `"+2 hours"`
        #[arg(long)]
        repeat: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },

    /// Process jobs
    Work {
        /// Handle at most one job and exit
        #[arg(long)]
        once: bool,
        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Comma-separated queue names
        #[arg(long = "queue", value_delimiter = ',')]
        queues: Vec<String>,
        #[arg(long)]
        tries: Option<u32>,
        /// Retry delay in seconds
        #[arg(long)]
        delay: Option<u64>,
        /// Idle poll interval in seconds
        #[arg(long)]
        sleep: Option<u64>,
        #[arg(long)]
        stale_after: Option<u64>,
        /// Skip the summary log file
        #[arg(long)]
        no_log: bool,
    },

    /// List jobs
    List {
        #[arg(long)]
        queue: Option<String>,
        /// pending, reserved, processing or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 0)]
        from: usize,
        #[arg(long, default_value_t = 50)]
        to: usize,
    },

    /// List archived failures, most recent first
    Failed {
        #[arg(long, default_value_t = 0)]
        from: usize,
        #[arg(long, default_value_t = 50)]
        to: usize,
    },

    /// Show job counts per status
    Stats,

    /// Requeue every archived job with a fresh retry budget
    RetryFailed,

    /// Delete archived jobs
    ClearFailed,

    /// Delete every job
    ClearAll,

    /// Delete every repeating job
    ClearRepeated,

    /// Delete one job
    Remove { id: i64 },

    /// Delete every job on a queue
    RemoveQueue { name: String },

    /// Release reservations left behind by dead workers
    Recover {
        #[arg(long)]
        stale_after: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backlog=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > BACKLOG_CONFIG env > ~/.backlog/backlog.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("BACKLOG_CONFIG").ok());
    let mut config = BacklogConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        BacklogConfig::default()
    });
    if let Some(path) = cli.database {
        config.database.path = path;
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening queue database");
    let queue = Queue::open_with_timeout(
        db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .with_context(|| format!("cannot open {db_path}"))?;

    run(cli.command, queue, &config).await
}

async fn run(command: Command, queue: Queue, config: &BacklogConfig) -> anyhow::Result<()> {
    match command {
        Command::Install => {
            queue.install()?;
            println!("Installed queue tables in {}", config.database.path);
        }

        Command::Push {
            callback,
            params,
            queue: name,
            delay,
            repeat,
            priority,
        } => {
            let delay = chrono::Duration::try_seconds(delay)
                .ok_or_else(|| anyhow::anyhow!("--delay {delay} is out of range"))?;
            let parameters = params.iter().map(String::as_str).map(parse_param).collect();
            let mut job = Job::new(callback, parameters)
                .delay(delay)
                .priority(priority);
            if let Some(ref interval) = repeat {
                job = job.repeat(interval);
            }
            let id = queue.push(&job, &name)?;
            println!(
                "Pushed job #{id} on `{name}`, due {}",
                job.scheduled_time().to_rfc3339()
            );
        }

        Command::Work {
            once,
            timeout,
            queues,
            tries,
            delay,
            sleep,
            stale_after,
            no_log,
        } => {
            let mut options = WorkOptions::from(&config.worker)
                .once(once)
                .log(&config.log);
            if let Some(secs) = timeout {
                options = options.timeout(Duration::from_secs(secs));
            }
            if !queues.is_empty() {
                options = options.queues(queues);
            }
            if let Some(n) = tries {
                options = options.tries(n);
            }
            if let Some(secs) = delay {
                options = options.delay(Duration::from_secs(secs));
            }
            if let Some(secs) = sleep {
                options = options.sleep(Duration::from_secs(secs));
            }
            if let Some(secs) = stale_after {
                options = options.stale_after(Duration::from_secs(secs));
            }
            if no_log {
                options = options.without_log();
            }

            let worker = Worker::new(Arc::new(queue), Arc::new(builtins::registry()));
            info!(worker.id = %worker.id(), queues = ?options.queues, "worker starting");
            let summary = worker.work(&options).await?;
            println!("{}", summary.line());
        }

        Command::List {
            queue: name,
            status,
            from,
            to,
        } => {
            let mut filter = JobFilter::default();
            if let Some(name) = name {
                filter = filter.queue(name);
            }
            if let Some(status) = status {
                filter = filter.status(status.parse::<JobStatus>()?);
            }
            let jobs = queue.get_jobs(&filter, from, to)?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "#{:<6} {:<10} {:<12} attempts={} priority={} due={} repeat={} {}",
                    job.id,
                    job.status,
                    job.queue,
                    job.attempts,
                    job.priority,
                    job.scheduled_time.to_rfc3339(),
                    job.repeat.as_deref().unwrap_or("-"),
                    job.payload
                );
            }
        }

        Command::Failed { from, to } => {
            let failed = queue.get_failed_jobs(from, to)?;
            if failed.is_empty() {
                println!("No failed jobs.");
            }
            for row in failed {
                let first_line = row.exception.lines().next().unwrap_or_default();
                println!(
                    "#{:<6} failed_at={} attempts={} {}",
                    row.job_id,
                    row.failed_at.to_rfc3339(),
                    row.attempts,
                    first_line
                );
            }
        }

        Command::Stats => {
            let stats = queue.stats()?;
            println!("pending     {}", stats.pending);
            println!("reserved    {}", stats.reserved);
            println!("processing  {}", stats.processing);
            println!("failed      {}", stats.failed);
            println!("archived    {}", stats.archived);
            println!("total       {}", stats.total());
        }

        Command::RetryFailed => {
            let n = queue.retry_failed_jobs()?;
            println!("Requeued {n} failed job(s)");
        }

        Command::ClearFailed => {
            let n = queue.clear_failed_jobs()?;
            println!("Removed {n} failed job(s)");
        }

        Command::ClearAll => {
            let n = queue.clear_all_jobs()?;
            println!("Removed {n} job(s)");
        }

        Command::ClearRepeated => {
            let n = queue.clear_repeated_jobs()?;
            println!("Removed {n} repeating job(s)");
        }

        Command::Remove { id } => {
            queue.remove_job_by_id(id)?;
            println!("Removed job #{id}");
        }

        Command::RemoveQueue { name } => {
            let n = queue.remove_queue(&name)?;
            println!("Removed {n} job(s) from `{name}`");
        }

        Command::Recover { stale_after } => {
            let secs = stale_after.unwrap_or(config.worker.stale_after_secs);
            let n = queue.recover_stale_jobs(Duration::from_secs(secs))?;
            println!("Released {n} stale reservation(s)");
        }
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_param(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn params_fall_back_to_strings() {
        assert_eq!(parse_param("42"), json!(42));
        assert_eq!(parse_param(r#"{"to":"ops"}"#), json!({"to": "ops"}));
        assert_eq!(parse_param("hello"), json!("hello"));
    }

    #[test]
    fn work_queue_flag_splits_on_commas() {
        let cli = Cli::parse_from(["backlog", "work", "--once", "--queue", "emails,reports"]);
        match cli.command {
            Command::Work { once, queues, .. } => {
                assert!(once);
                assert_eq!(queues, vec!["emails", "reports"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn push_collects_repeated_params() {
        let cli = Cli::parse_from([
            "backlog", "push", "Mailer::send", "--param", "\"a@b.c\"", "--param", "3",
            "--repeat", "daily", "--database", "/tmp/x.db",
        ]);
        assert_eq!(cli.database.as_deref(), Some("/tmp/x.db"));
        match cli.command {
            Command::Push {
                callback,
                params,
                repeat,
                queue,
                ..
            } => {
                assert_eq!(callback, "Mailer::send");
                assert_eq!(params, vec!["\"a@b.c\"", "3"]);
                assert_eq!(repeat.as_deref(), Some("daily"));
                assert_eq!(queue, "default");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_then_work_once_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BacklogConfig::default();
        config.database.path = dir.path().join("q.db").to_string_lossy().into_owned();
        config.log.enabled = false;

        let open = || Queue::open(&config.database.path).unwrap();
        run(Command::Install, open(), &config).await.unwrap();
        run(
            Command::Push {
                callback: "log".into(),
                params: vec!["hi".into()],
                queue: "default".into(),
                delay: 0,
                repeat: None,
                priority: 0,
            },
            open(),
            &config,
        )
        .await
        .unwrap();
        assert_eq!(open().stats().unwrap().pending, 1);

        let work = Cli::parse_from(["backlog", "work", "--once"]).command;
        run(work, open(), &config).await.unwrap();
        assert_eq!(open().stats().unwrap().total(), 0);
    }

    #[tokio::test]
    async fn push_rejects_out_of_range_delay() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BacklogConfig::default();
        config.database.path = dir.path().join("q.db").to_string_lossy().into_owned();

        let open = || Queue::open(&config.database.path).unwrap();
        run(Command::Install, open(), &config).await.unwrap();
        for delay in [i64::MAX, 9_223_372_036_854_775, -9_223_372_036_854_775, 400_000_000_000] {
            let push = Command::Push {
                callback: "log".into(),
                params: vec![],
                queue: "default".into(),
                delay,
                repeat: None,
                priority: 0,
            };
            assert!(run(push, open(), &config).await.is_err(), "delay {delay}");
        }
        assert_eq!(open().stats().unwrap().total(), 0);
    }
}
