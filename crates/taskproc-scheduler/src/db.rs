//! SQLite-backed schedule definitions.
//!
//! The `job_schedules` table is the dynamic counterpart of the static
//! `[[jobs]]` list: operators edit rows, the reconciler picks them up on its
//! next pass.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use taskproc_core::config::JobDefinition;
use taskproc_core::types::{GroupName, JobId, MisfirePolicy};
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::source::ScheduleSource;

/// Initialise the schedule schema in `conn`. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_schedules (
            id              TEXT    NOT NULL PRIMARY KEY,
            job             TEXT    NOT NULL,
            grp             TEXT,               -- NULL means the reconciler's group
            cron            TEXT    NOT NULL,
            timezone        TEXT    NOT NULL DEFAULT 'UTC',
            enabled         INTEGER NOT NULL DEFAULT 1,
            misfire_policy  TEXT    NOT NULL DEFAULT 'fire_now_and_proceed',
            comment         TEXT    NOT NULL DEFAULT ''
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_schedules_job ON job_schedules (job);
        ",
    )?;
    Ok(())
}

/// Reads [`JobDefinition`]s from the `job_schedules` table.
#[derive(Clone)]
pub struct SqliteScheduleSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScheduleSource {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Insert or overwrite the row with `def.id`.
    pub fn upsert(&self, def: &JobDefinition) -> Result<()> {
        let conn = self.conn.lock().expect("schedule db lock poisoned");
        conn.execute(
            "INSERT INTO job_schedules (id, job, grp, cron, timezone, enabled, misfire_policy, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                job = excluded.job,
                grp = excluded.grp,
                cron = excluded.cron,
                timezone = excluded.timezone,
                enabled = excluded.enabled,
                misfire_policy = excluded.misfire_policy,
                comment = excluded.comment",
            params![
                def.id,
                def.job.as_str(),
                def.group.as_ref().map(|g| g.as_str()),
                def.cron,
                def.timezone,
                def.enabled as i64,
                def.misfire_policy.to_string(),
                def.comment,
            ],
        )?;
        Ok(())
    }

    /// Delete the row with `id`. Returns whether a row existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("schedule db lock poisoned");
        let n = conn.execute("DELETE FROM job_schedules WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<JobDefinition>> {
        let conn = self.conn.lock().expect("schedule db lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, job, grp, cron, timezone, enabled, misfire_policy, comment
                 FROM job_schedules WHERE id = ?1",
                [id],
                read_row,
            )
            .optional()?;
        Ok(row.map(into_definition))
    }

    /// Every row, ordered by job then id.
    pub fn list(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn.lock().expect("schedule db lock poisoned");
        list_rows(&conn)
    }
}

#[async_trait]
impl ScheduleSource for SqliteScheduleSource {
    async fn load(&self, jobs: &[JobId]) -> Result<Vec<JobDefinition>> {
        let conn = Arc::clone(&self.conn);
        let jobs = jobs.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<JobDefinition>> {
            let conn = conn.lock().expect("schedule db lock poisoned");
            let all = list_rows(&conn)?;
            Ok(all.into_iter().filter(|d| jobs.contains(&d.job)).collect())
        })
        .await
        .map_err(|e| SchedulerError::ReconciliationSource(format!("schedule query task failed: {e}")))?
    }
}

type Row = (String, String, Option<String>, String, String, bool, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((
        row.get(0)?, // id
        row.get(1)?, // job
        row.get(2)?, // grp
        row.get(3)?, // cron
        row.get(4)?, // timezone
        row.get(5)?, // enabled
        row.get(6)?, // misfire_policy
        row.get(7)?, // comment
    ))
}

fn list_rows(conn: &Connection) -> Result<Vec<JobDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT id, job, grp, cron, timezone, enabled, misfire_policy, comment
         FROM job_schedules ORDER BY job, id",
    )?;
    let rows = stmt.query_map([], read_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().map(into_definition).collect())
}

fn into_definition((id, job, grp, cron, timezone, enabled, policy, comment): Row) -> JobDefinition {
    let misfire_policy = policy.parse::<MisfirePolicy>().unwrap_or_else(|e| {
        warn!(%id, %job, "{e}; using the default policy");
        MisfirePolicy::default()
    });
    JobDefinition {
        id,
        job: JobId::new(job),
        group: grp.map(GroupName::new),
        cron,
        timezone,
        enabled,
        misfire_policy,
        comment,
    }
}
