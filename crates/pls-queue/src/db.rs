use std::time::Duration;

use pls_core::DatabaseConfig;
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and an index on `status` so the
/// per-status listings stay cheap as terminal jobs accumulate. The CHECK
/// constraint keeps the uninitialised `none` status out of the table.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            status      TEXT    NOT NULL
                        CHECK (status IN ('pending', 'in_progress', 'failed', 'succeeded')),
            kind        TEXT    NOT NULL,   -- variant discriminator
            payload     TEXT    NOT NULL,   -- JSON-encoded variant fields
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created_at);
        ",
    )?;
    Ok(())
}

/// Open a connection to the shared database file, ready for concurrent use.
///
/// WAL lets readers proceed while one writer holds the lock; the busy timeout
/// makes competing writers queue instead of failing straight away.
pub fn open(config: &DatabaseConfig) -> Result<Connection> {
    let conn = Connection::open(&config.path)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}
