use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_TRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SLEEP_SECS: u64 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 3600;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024; // rotate past 5 MiB

/// Top-level config (backlog.toml + BACKLOG_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Where the durable store lives and how connections wait on locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Defaults for `backlog work`. Every field can be overridden on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    #[serde(default = "default_tries")]
    pub tries: u32,
    /// Wall-clock budget of one `work` invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Idle delay between empty polls.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,
    /// How far in the future a failed-but-retryable job is rescheduled.
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: u64,
    /// Reservations older than this are considered abandoned by a crashed worker.
    /// Must exceed the longest legitimate job runtime.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            tries: DEFAULT_TRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            sleep_secs: DEFAULT_SLEEP_SECS,
            delay_secs: DEFAULT_RETRY_DELAY_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

/// Worker summary log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_log_path")]
    pub path: String,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_log_path(),
            max_bytes: DEFAULT_LOG_MAX_BYTES,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_queues() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_string()]
}
fn default_tries() -> u32 {
    DEFAULT_TRIES
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_sleep_secs() -> u64 {
    DEFAULT_SLEEP_SECS
}
fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_log_max_bytes() -> u64 {
    DEFAULT_LOG_MAX_BYTES
}
fn default_db_path() -> String {
    format!("{}/backlog.db", home_dir())
}
fn default_log_path() -> String {
    format!("{}/worker.log", home_dir())
}

fn home_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.backlog", home)
}

impl BacklogConfig {
    /// Load config from a TOML file with BACKLOG_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `~/.backlog/backlog.toml`.
    /// A missing file is not an error; every field has a default.
    ///
    /// Nested keys are separated by a double underscore so field names keep
    /// their own underscores, e.g. `BACKLOG_WORKER__STALE_AFTER_SECS=600`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: BacklogConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BACKLOG_").split("__"))
            .extract()
            .map_err(|e| crate::error::BacklogError::Config(e.to_string()))?;

        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    format!("{}/backlog.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = BacklogConfig::load(path.to_str()).expect("load");

        assert_eq!(config.worker.tries, DEFAULT_TRIES);
        assert_eq!(config.worker.queues, vec!["default".to_string()]);
        assert_eq!(config.log.max_bytes, DEFAULT_LOG_MAX_BYTES);
        assert!(config.log.enabled);
        assert!(config.database.path.ends_with("backlog.db"));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
[database]
path = "/tmp/jobs.db"

[worker]
tries = 7
queues = ["emails", "default"]

[log]
enabled = false
"#
        )
        .expect("write");

        let config = BacklogConfig::load(file.path().to_str()).expect("load");
        assert_eq!(config.database.path, "/tmp/jobs.db");
        assert_eq!(config.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert_eq!(config.worker.tries, 7);
        assert_eq!(config.worker.queues, vec!["emails", "default"]);
        // untouched field keeps its default
        assert_eq!(config.worker.sleep_secs, DEFAULT_SLEEP_SECS);
        assert!(!config.log.enabled);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[worker]\ntries = \"many\"").expect("write");

        let err = BacklogConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
