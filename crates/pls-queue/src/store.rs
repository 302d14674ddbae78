use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use pls_core::DatabaseConfig;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::{
    db,
    error::{QueueError, Result},
    types::{JobId, JobRecord, JobStatus, NewJob},
};

/// Durable, queryable storage for job records.
///
/// [`compare_and_set_status`](JobStore::compare_and_set_status) is the only
/// mutation of an existing record and the only source of mutual exclusion
/// between workers. Implementations must execute it as one indivisible
/// store-side operation, never as read-then-write from the caller.
pub trait JobStore: Send + Sync {
    /// Persist a new record as `Pending`, whatever status the caller set.
    /// Generates an id when none is supplied and returns the stored record.
    fn insert(&self, job: NewJob) -> Result<JobRecord>;

    /// Up to `limit` ids currently in `status`, in no particular order.
    /// Nothing is locked: the ids may be stale by the time they are used.
    fn list_ids_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<JobId>>;

    /// Atomically move `id` from `expected` to `new`.
    ///
    /// Returns the record as it was before the update, or `None` when no
    /// record has that id in that status (lost race, already resolved, or
    /// unknown id). `None` is an ordinary outcome, not an error.
    fn compare_and_set_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<Option<JobRecord>>;

    /// Every record currently in `status`. Read-only, oldest first.
    fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>>;

    /// Single-record lookup. Read-only.
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;
}

/// [`JobStore`] over one SQLite connection.
///
/// Each worker opens its own store so no two workers share a connection;
/// the database file is their only meeting point. The `Mutex` only makes the
/// connection `Sync` for the owner.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a fresh connection to the configured database file.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        Self::new(db::open(config)?)
    }

    /// Private in-memory store, for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QueueError::InvariantViolation("store connection mutex poisoned".into()))
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(kind = %job.kind))]
    fn insert(&self, job: NewJob) -> Result<JobRecord> {
        let id = job.id.unwrap_or_else(JobId::generate);
        let payload = serde_json::to_string(&job.payload)?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        if !matches!(job.status, JobStatus::None | JobStatus::Pending) {
            debug!(requested = %job.status, "insert normalises status to pending");
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, status, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id.as_str(),
                JobStatus::Pending.as_str(),
                job.kind,
                payload,
                created_at
            ],
        )
        .map_err(|e| map_insert_error(e, &id))?;

        info!(job_id = %id, "job inserted");

        Ok(JobRecord {
            id,
            status: JobStatus::Pending,
            kind: job.kind,
            payload: job.payload,
            created_at,
        })
    }

    fn list_ids_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<JobId>> {
        storable(status)?;
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT id FROM jobs WHERE status = ?1 LIMIT ?2")?;
        let ids = stmt
            .query_map(
                rusqlite::params![status.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| row.get::<_, String>(0),
            )?
            .map(|r| r.map(JobId::from))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    #[instrument(skip_all, fields(job_id = %id, expected = %expected, new = %new))]
    fn compare_and_set_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<Option<JobRecord>> {
        storable(expected)?;
        storable(new)?;

        // One statement: SQLite serialises writers, so for a given id exactly
        // one concurrent caller finds the row still in `expected`.
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "UPDATE jobs SET status = ?1
                 WHERE id = ?2 AND status = ?3
                 RETURNING id, kind, payload, created_at",
                rusqlite::params![new.as_str(), id.as_str(), expected.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?, // id
                        row.get::<_, String>(1)?, // kind
                        row.get::<_, String>(2)?, // payload JSON
                        row.get::<_, String>(3)?, // created_at
                    ))
                },
            )
            .optional()?;

        let Some((id, kind, payload, created_at)) = row else {
            debug!("no record in expected status");
            return Ok(None);
        };

        // The row is already committed. An unreadable payload is handed on
        // as a raw string so the claim still reaches a handler, whose decode
        // fails and turns into a reported failure.
        let payload = serde_json::from_str(&payload).unwrap_or_else(|e| {
            warn!(job_id = %id, error = %e, "stored payload is not valid JSON");
            serde_json::Value::String(payload)
        });

        // Only `status` was written, so the pre-update snapshot is the
        // returned row carrying the status we matched on.
        Ok(Some(JobRecord {
            id: JobId::from(id),
            status: expected,
            kind,
            payload,
            created_at,
        }))
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        storable(status)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, status, kind, payload, created_at
             FROM jobs WHERE status = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([status.as_str()], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_record).collect()
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, status, kind, payload, created_at FROM jobs WHERE id = ?1",
                [id.as_str()],
                read_row,
            )
            .optional()?;
        row.map(into_record).transpose()
    }
}

type RawRow = (String, String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?, // id
        row.get(1)?, // status
        row.get(2)?, // kind
        row.get(3)?, // payload JSON
        row.get(4)?, // created_at
    ))
}

fn into_record((id, status, kind, payload, created_at): RawRow) -> Result<JobRecord> {
    let status: JobStatus = status.parse().map_err(QueueError::InvariantViolation)?;
    storable(status)?;
    Ok(JobRecord {
        id: JobId::from(id),
        status,
        kind,
        payload: serde_json::from_str(&payload)?,
        created_at,
    })
}

/// `None` is the uninitialised default and has no place in the store.
fn storable(status: JobStatus) -> Result<()> {
    if status == JobStatus::None {
        return Err(QueueError::InvariantViolation(
            "job status 'none' must never reach the store".into(),
        ));
    }
    Ok(())
}

fn map_insert_error(err: rusqlite::Error, id: &JobId) -> QueueError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            QueueError::DuplicateKey { id: id.to_string() }
        }
        other => QueueError::StoreUnavailable(other),
    }
}
