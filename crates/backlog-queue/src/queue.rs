use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::db::init_db;
use crate::error::{JobFailure, QueueError, Result};
use crate::job::Job;
use crate::repeat;
use crate::types::{
    format_ts, is_storable, now, parse_ts, FailedJobRecord, JobFilter, JobMetadata, JobRecord, JobStatus, Payload,
    QueueStats,
};

const JOB_COLUMNS: &str = "id, payload, queue, scheduled_time, created_at, repeat, priority,
                           status, attempts, reserved_at";

const FAILED_COLUMNS: &str = "id, job_id, failed_at, exception, attempts";

/// Default wait on a locked database file before giving up.
pub const DEFAULT_BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// What `Queue::complete` did with a successfully executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Non-repeating job: the row is gone.
    Deleted,
    /// Repeating job: back to pending, due at the contained instant.
    Rescheduled(DateTime<Utc>),
}

/// SQLite-backed durable store.
///
/// One `Queue` owns one connection. Workers that should run concurrently
/// each open their own `Queue` on the same file; the claim protocol in
/// [`get_next_job`](Self::get_next_job) keeps them from double-claiming.
pub struct Queue {
    db: Mutex<Connection>,
}

impl Queue {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: std::time::Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(busy_timeout)?;
        debug!(path = %path.as_ref().display(), "queue store opened");
        Self::from_connection(conn)
    }

    /// Private in-memory store, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an already-open connection, applying the pragmas the store relies on.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written;
        // any open transaction was rolled back when it was dropped.
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the schema. Safe to run repeatedly.
    pub fn install(&self) -> Result<()> {
        init_db(&self.conn())?;
        info!("queue schema installed");
        Ok(())
    }

    // --- producer side -------------------------------------------------------

    /// Durably enqueue `job` on `queue`. Returns the new row id.
    #[instrument(skip(self, job), fields(callback = %job.callback()))]
    pub fn push(&self, job: &Job, queue: &str) -> Result<i64> {
        if let Some(expr) = job.repeat_interval() {
            repeat::RepeatInterval::parse(expr)?;
        }
        if !is_storable(job.scheduled_time()) {
            return Err(QueueError::InvalidSchedule(job.scheduled_time().to_rfc3339()));
        }
        let payload = serde_json::to_string(&job.payload())?;
        let now_str = format_ts(now());

        let db = self.conn();
        db.execute(
            "INSERT INTO jobs
             (payload, queue, scheduled_time, created_at, repeat, priority, status, attempts, reserved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, NULL)",
            params![
                payload,
                queue,
                format_ts(job.scheduled_time()),
                now_str,
                job.repeat_interval(),
                job.get_priority(),
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(job_id = id, %queue, "job pushed");
        Ok(id)
    }

    // --- claim ---------------------------------------------------------------

    /// Atomically reserve the next due pending job on any of `queues`.
    ///
    /// Select and conditional update run in one IMMEDIATE transaction. If the
    /// update matches nothing another worker won the race and `Ok(None)` is
    /// returned without re-selecting; the next poll picks a different row.
    ///
    /// A row whose payload cannot be decoded is archived on the spot and
    /// reported as [`QueueError::MalformedPayload`].
    pub fn get_next_job<S: AsRef<str>>(&self, queues: &[S]) -> Result<Option<Job>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let names: Vec<&str> = queues.iter().map(AsRef::as_ref).collect();
        let reserved_at = now();
        let now_str = format_ts(reserved_at);

        let placeholders = (0..names.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, COALESCE(CAST(attempts AS INTEGER), 0) FROM jobs
             WHERE status = 'pending' AND scheduled_time <= ?1 AND queue IN ({placeholders})
             ORDER BY priority DESC, scheduled_time ASC, id ASC
             LIMIT 1"
        );

        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<(i64, i64)> = {
            let args = std::iter::once(now_str.as_str()).chain(names.iter().copied());
            tx.query_row(&sql, params_from_iter(args), |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?
        };
        let Some((id, attempts)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE jobs SET status = 'reserved', reserved_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_str, id],
        )?;
        if claimed == 0 {
            tx.commit()?;
            debug!(job_id = id, "lost reservation race");
            return Ok(None);
        }

        // Only the id is trusted so far: a row that fails to decode is
        // archived instead of blocking every job queued behind it.
        let record = match tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_record,
        ) {
            Ok(record) => Ok(record),
            Err(
                e @ (rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)),
            ) => Err(format!("undecodable row: {e}")),
            Err(e) => return Err(e.into()),
        };
        let decoded = record.and_then(|record| {
            serde_json::from_str::<Payload>(&record.payload)
                .map(|payload| (record, payload))
                .map_err(|e| e.to_string())
        });

        match decoded {
            Ok((record, payload)) => {
                tx.commit()?;
                debug!(job_id = id, queue = %record.queue, "job reserved");
                let metadata = JobMetadata {
                    id,
                    queue: record.queue,
                    attempts: record.attempts,
                    created_at: record.created_at,
                    status: JobStatus::Reserved,
                    reserved_at: Some(reserved_at),
                    failed_at: None,
                    exception: None,
                };
                Ok(Some(Job::from_parts(
                    payload,
                    record.scheduled_time,
                    record.repeat,
                    record.priority,
                    metadata,
                )))
            }
            Err(reason) => {
                let failure = JobFailure::MalformedPayload(reason.clone());
                let attempts = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
                archive_in(
                    &tx,
                    id,
                    attempts,
                    &failure.exception_text(),
                    &now_str,
                    Hold::Reserved(&now_str),
                )?;
                tx.commit()?;
                warn!(job_id = id, %reason, "malformed job archived");
                Err(QueueError::MalformedPayload { id, reason })
            }
        }
    }

    // --- worker transitions --------------------------------------------------

    /// Move a reserved row to `processing` and count the attempt.
    /// Returns the attempt count including this one; callers pass it back to
    /// the outcome transitions as proof they still hold the row.
    pub fn mark_processing(&self, id: i64) -> Result<u32> {
        let now_str = format_ts(now());
        self.conn()
            .query_row(
                "UPDATE jobs SET status = 'processing', attempts = attempts + 1, reserved_at = ?1
                 WHERE id = ?2 AND status = 'reserved'
                 RETURNING attempts",
                params![now_str, id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(QueueError::JobNotFound { id })
    }

    /// Record a successful run: repeating jobs go back to pending one
    /// interval from now with attempts reset, others are deleted.
    ///
    /// The row must still be `processing` with the job's attempt count,
    /// otherwise [`QueueError::LostClaim`] is returned and nothing changes.
    pub fn complete(&self, job: &Job) -> Result<Completion> {
        let id = job.id().ok_or(QueueError::NotPersisted)?;
        let attempts = job.attempts();

        if let Some(expr) = job.repeat_interval().filter(|_| job.is_repeated()) {
            let next = repeat::next_run(expr, now())?.trunc_subsecs(6);
            let n = self.conn().execute(
                "UPDATE jobs SET status = 'pending', scheduled_time = ?1, attempts = 0,
                 reserved_at = NULL
                 WHERE id = ?2 AND status = 'processing' AND attempts = ?3",
                params![format_ts(next), id, attempts],
            )?;
            if n == 0 {
                return Err(QueueError::LostClaim { id });
            }
            return Ok(Completion::Rescheduled(next));
        }

        let n = self.conn().execute(
            "DELETE FROM jobs WHERE id = ?1 AND status = 'processing' AND attempts = ?2",
            params![id, attempts],
        )?;
        if n == 0 {
            return Err(QueueError::LostClaim { id });
        }
        Ok(Completion::Deleted)
    }

    /// Put a failed-but-retryable job back to pending `delay` from now.
    /// Attempts are left as they are so repeated failures accumulate.
    /// `attempts` is the count returned by [`mark_processing`](Self::mark_processing).
    pub fn release_for_retry(
        &self,
        id: i64,
        attempts: u32,
        delay: std::time::Duration,
    ) -> Result<DateTime<Utc>> {
        let next = (now() + to_chrono(delay)).trunc_subsecs(6);
        let n = self.conn().execute(
            "UPDATE jobs SET status = 'pending', scheduled_time = ?1, reserved_at = NULL
             WHERE id = ?2 AND status = 'processing' AND attempts = ?3",
            params![format_ts(next), id, attempts],
        )?;
        if n == 0 {
            return Err(QueueError::LostClaim { id });
        }
        Ok(next)
    }

    /// Archive a permanently failed job: one `failed_jobs` row plus
    /// `status = 'failed'`, written in a single transaction. Like
    /// [`release_for_retry`](Self::release_for_retry) it only applies while
    /// the row is `processing` at `attempts`.
    pub fn archive_failure(&self, id: i64, attempts: u32, exception: &str) -> Result<()> {
        let now_str = format_ts(now());
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        archive_in(&tx, id, attempts, exception, &now_str, Hold::Processing)?;
        tx.commit()?;
        warn!(job_id = id, attempts, "job archived as failed");
        Ok(())
    }

    /// Release reservations older than `stale_after`, left behind by workers
    /// that died mid-job. Returns how many rows went back to pending.
    ///
    /// `stale_after` must exceed the longest legitimate job runtime: a job
    /// still running past it will be claimed and executed a second time.
    #[instrument(skip(self))]
    pub fn recover_stale_jobs(&self, stale_after: std::time::Duration) -> Result<usize> {
        let cutoff = format_ts(now() - to_chrono(stale_after));
        let n = self.conn().execute(
            "UPDATE jobs SET status = 'pending', reserved_at = NULL
             WHERE status IN ('processing', 'reserved')
               AND reserved_at IS NOT NULL AND reserved_at < ?1",
            [cutoff],
        )?;
        if n > 0 {
            warn!(count = n, "stale reservations released");
        }
        Ok(n)
    }

    // --- deletions -------------------------------------------------------------

    /// Delete one job (and its archive row, if any).
    pub fn remove_job_by_id(&self, id: i64) -> Result<()> {
        let n = self.conn().execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(QueueError::JobNotFound { id });
        }
        info!(job_id = id, "job removed");
        Ok(())
    }

    /// Delete every job on a logical queue.
    pub fn remove_queue(&self, name: &str) -> Result<usize> {
        let n = self.conn().execute("DELETE FROM jobs WHERE queue = ?1", [name])?;
        info!(queue = %name, count = n, "queue removed");
        Ok(n)
    }

    /// Delete every job and every archive row.
    pub fn clear_all_jobs(&self) -> Result<usize> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM failed_jobs", [])?;
        let n = tx.execute("DELETE FROM jobs", [])?;
        tx.commit()?;
        info!(count = n, "all jobs cleared");
        Ok(n)
    }

    pub fn clear_repeated_jobs(&self) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM jobs WHERE repeat IS NOT NULL AND TRIM(repeat) != ''",
            [],
        )?;
        info!(count = n, "repeated jobs cleared");
        Ok(n)
    }

    /// Drop the archive together with the `failed` job rows it points at.
    pub fn clear_failed_jobs(&self) -> Result<usize> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let n = tx.execute(
            "DELETE FROM jobs
             WHERE status = 'failed' OR id IN (SELECT job_id FROM failed_jobs)",
            [],
        )?;
        tx.execute("DELETE FROM failed_jobs", [])?;
        tx.commit()?;
        info!(count = n, "failed jobs cleared");
        Ok(n)
    }

    /// Reset every archived job to pending with a fresh retry budget and
    /// empty the archive. All or nothing.
    pub fn retry_failed_jobs(&self) -> Result<usize> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "UPDATE jobs SET status = 'pending', attempts = 0, reserved_at = NULL
             WHERE id IN (SELECT job_id FROM failed_jobs)",
            [],
        )?;
        tx.execute("DELETE FROM failed_jobs", [])?;
        tx.commit()?;
        if n > 0 {
            info!(count = n, "failed jobs requeued");
        }
        Ok(n)
    }

    // --- read views ----------------------------------------------------------

    /// Rows `[from, to)` of the jobs matching `filter`, ordered by id.
    pub fn get_jobs(&self, filter: &JobFilter, from: usize, to: usize) -> Result<Vec<JobRecord>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(ref queue) = filter.queue {
            args.push(SqlValue::Text(queue.clone()));
            clauses.push(format!("queue = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(SqlValue::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        args.push(SqlValue::Integer(page_len(from, to)));
        args.push(SqlValue::Integer(from as i64));
        sql.push_str(&format!(" ORDER BY id ASC LIMIT ?{} OFFSET ?{}", args.len() - 1, args.len()));

        let db = self.conn();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Archive rows `[from, to)`, most recent failure first.
    pub fn get_failed_jobs(&self, from: usize, to: usize) -> Result<Vec<FailedJobRecord>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {FAILED_COLUMNS} FROM failed_jobs
             ORDER BY failed_at DESC, id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![page_len(from, to), from as i64], row_to_failed)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_record,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_failed_job(&self, job_id: i64) -> Result<Option<FailedJobRecord>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {FAILED_COLUMNS} FROM failed_jobs WHERE job_id = ?1"),
                [job_id],
                row_to_failed,
            )
            .optional()?;
        Ok(row)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let db = self.conn();
        let mut stats = QueueStats::default();

        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Reserved => stats.reserved = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        let archived: i64 = db.query_row("SELECT COUNT(*) FROM failed_jobs", [], |row| row.get(0))?;
        stats.archived = archived.max(0) as u64;
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str, args: impl rusqlite::Params) -> Result<usize> {
        Ok(self.conn().execute(sql, args)?)
    }
}

/// The state a caller expects to find a row in before archiving it.
enum Hold<'a> {
    /// Just reserved inside the same claim transaction, at this timestamp.
    Reserved(&'a str),
    /// Being executed, at the archived attempt count.
    Processing,
}

fn archive_in(
    conn: &Connection,
    id: i64,
    attempts: u32,
    exception: &str,
    now_str: &str,
    hold: Hold<'_>,
) -> Result<()> {
    let n = match hold {
        Hold::Reserved(reserved_at) => conn.execute(
            "UPDATE jobs SET status = 'failed', attempts = ?1, reserved_at = NULL
             WHERE id = ?2 AND status = 'reserved' AND reserved_at = ?3",
            params![attempts, id, reserved_at],
        )?,
        Hold::Processing => conn.execute(
            "UPDATE jobs SET status = 'failed', reserved_at = NULL
             WHERE id = ?1 AND status = 'processing' AND attempts = ?2",
            params![id, attempts],
        )?,
    };
    if n == 0 {
        return Err(QueueError::LostClaim { id });
    }

    // At most one archive row per job.
    conn.execute("DELETE FROM failed_jobs WHERE job_id = ?1", [id])?;
    conn.execute(
        "INSERT INTO failed_jobs (job_id, failed_at, exception, attempts)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, now_str, exception, attempts],
    )?;
    Ok(())
}

fn page_len(from: usize, to: usize) -> i64 {
    to.saturating_sub(from) as i64
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => parse_ts(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get(7)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(JobRecord {
        id: row.get(0)?,
        payload: row.get(1)?,
        queue: row.get(2)?,
        scheduled_time: ts_col(row, 3)?,
        created_at: ts_col(row, 4)?,
        repeat: row.get(5)?,
        priority: row.get(6)?,
        status,
        attempts: row.get(8)?,
        reserved_at: opt_ts_col(row, 9)?,
    })
}

fn row_to_failed(row: &Row<'_>) -> rusqlite::Result<FailedJobRecord> {
    Ok(FailedJobRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        failed_at: ts_col(row, 2)?,
        exception: row.get(3)?,
        attempts: row.get(4)?,
    })
}
