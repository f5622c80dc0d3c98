use rusqlite::Connection;

use crate::error::Result;

/// Create the `jobs` and `failed_jobs` tables and their indexes.
///
/// Idempotent. Run once as an explicit provisioning step (`backlog install`)
/// rather than implicitly on first use.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_jobs_table(conn)?;
    create_failed_jobs_table(conn)?;
    Ok(())
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            payload         TEXT    NOT NULL,   -- {callback, parameters, hooks?}
            queue           TEXT    NOT NULL DEFAULT 'default',
            scheduled_time  TEXT    NOT NULL,   -- RFC 3339, fixed width
            created_at      TEXT    NOT NULL,
            repeat          TEXT,               -- NULL means run once
            priority        INTEGER NOT NULL DEFAULT 0,
            status          TEXT    NOT NULL DEFAULT 'pending',
            attempts        INTEGER NOT NULL DEFAULT 0,
            reserved_at     TEXT                -- set iff reserved/processing
        );

        -- Claim query: WHERE status = 'pending' AND scheduled_time <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_status_scheduled
            ON jobs (status, scheduled_time);
        CREATE INDEX IF NOT EXISTS idx_jobs_queue_status
            ON jobs (queue, status);
        -- Stale recovery only ever looks at reserved rows.
        CREATE INDEX IF NOT EXISTS idx_jobs_reserved_at
            ON jobs (reserved_at) WHERE reserved_at IS NOT NULL;
        ",
    )?;
    Ok(())
}

fn create_failed_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS failed_jobs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id      INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            failed_at   TEXT    NOT NULL,
            exception   TEXT    NOT NULL,
            attempts    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_failed_jobs_job
            ON failed_jobs (job_id);
        ",
    )?;
    Ok(())
}
