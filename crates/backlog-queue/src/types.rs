use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Lifecycle state of a `jobs` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its scheduled time or for a worker to claim it.
    Pending,
    /// Claimed by a worker, not yet executing.
    Reserved,
    /// Currently being executed.
    Processing,
    /// Retry budget exhausted; an archive row exists in `failed_jobs`.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Reserved => "reserved",
            JobStatus::Processing => "processing",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "reserved" => Ok(JobStatus::Reserved),
            "processing" => Ok(JobStatus::Processing),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// Reference to executable work that survives a round trip through storage.
///
/// Serialises as either a bare string (`"send_email"`) or a two-element
/// array (`["Mailer", "send"]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Callback {
    Name(String),
    Method(String, String),
}

impl Callback {
    pub fn name(name: impl Into<String>) -> Self {
        Callback::Name(name.into())
    }

    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Callback::Method(class.into(), method.into())
    }

    /// Registry lookup key: the name itself, or `Class::method`.
    pub fn key(&self) -> String {
        match self {
            Callback::Name(name) => name.clone(),
            Callback::Method(class, method) => format!("{class}::{method}"),
        }
    }
}

impl std::fmt::Display for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.key())
    }
}

impl From<&str> for Callback {
    /// `"Class::method"` becomes a method pair, anything else a plain name.
    fn from(s: &str) -> Self {
        match s.split_once("::") {
            Some((class, method)) if !class.is_empty() && !method.is_empty() => {
                Callback::method(class, method)
            }
            _ => Callback::name(s),
        }
    }
}

impl From<String> for Callback {
    fn from(s: String) -> Self {
        Callback::from(s.as_str())
    }
}

/// Lifecycle hooks stored alongside the callback so reconstructed jobs fire them too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<Callback>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<Callback>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Callback>,
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty() && self.catch.is_empty()
    }
}

/// The JSON document stored in `jobs.payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub callback: Callback,
    #[serde(default)]
    pub parameters: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Hooks::is_empty")]
    pub hooks: Hooks,
}

/// Persistence details attached to a `Job` once it has a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub id: i64,
    pub queue: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub reserved_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub exception: Option<String>,
}

/// A row of the `jobs` table, payload left encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub payload: String,
    pub queue: String,
    pub scheduled_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub repeat: Option<String>,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub reserved_at: Option<DateTime<Utc>>,
}

/// A row of the `failed_jobs` archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: i64,
    pub job_id: i64,
    pub failed_at: DateTime<Utc>,
    pub exception: String,
    pub attempts: u32,
}

/// Optional narrowing for `Queue::get_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Row counts for operator inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub reserved: u64,
    pub processing: u64,
    pub failed: u64,
    /// Rows in `failed_jobs`.
    pub archived: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.reserved + self.processing + self.failed
    }
}

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that lexical order in SQLite equals time order.
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Whether `dt` keeps the fixed-width text form (four-digit year).
pub(crate) fn is_storable(dt: DateTime<Utc>) -> bool {
    (1..=9999).contains(&dt.year())
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn callback_wire_shapes() {
        let name = serde_json::to_string(&Callback::name("send_email")).unwrap();
        assert_eq!(name, r#""send_email""#);

        let pair = serde_json::to_string(&Callback::method("Mailer", "send")).unwrap();
        assert_eq!(pair, r#"["Mailer","send"]"#);

        let back: Callback = serde_json::from_str(r#"["Reports","nightly"]"#).unwrap();
        assert_eq!(back.key(), "Reports::nightly");
    }

    #[test]
    fn callback_from_qualified_str() {
        assert_eq!(Callback::from("Mailer::send"), Callback::method("Mailer", "send"));
        assert_eq!(Callback::from("cleanup"), Callback::name("cleanup"));
        assert_eq!(Callback::from("::odd"), Callback::name("::odd"));
    }

    #[test]
    fn payload_without_hooks_omits_field() {
        let payload = Payload {
            callback: Callback::name("noop"),
            parameters: vec![serde_json::json!(1)],
            hooks: Hooks::default(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"callback":"noop","parameters":[1]}"#);

        // and plain {callback, parameters} payloads still decode
        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert!(decoded.hooks.is_empty());
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!("processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(format_ts(a), "2026-01-02T03:04:05.000000Z");
        assert_eq!(parse_ts(&format_ts(b)).unwrap(), b);
    }

    #[test]
    fn storable_range_is_four_digit_years() {
        assert!(is_storable(Utc::now()));
        assert!(!is_storable(DateTime::<Utc>::MAX_UTC));
        assert!(!is_storable(Utc.with_ymd_and_hms(10_000, 1, 1, 0, 0, 0).unwrap()));
    }
}
