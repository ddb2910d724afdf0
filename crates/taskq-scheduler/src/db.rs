use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates `tasks` and `dead_letters` (idempotent). The composite indexes
/// back the due, stuck and lost hand-off scans so each tick stays cheap even with
/// a large backlog of finished rows.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            payload     TEXT    NOT NULL DEFAULT '{}',  -- opaque JSON object
            status      TEXT    NOT NULL DEFAULT 'PENDING',
            priority    INTEGER NOT NULL DEFAULT 5,     -- 1..10
            attempts    INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            run_at      TEXT    NOT NULL,               -- RFC 3339, UTC, fixed width
            last_error  TEXT,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL,
            started_at  TEXT,
            finished_at TEXT
        ) STRICT;

        -- Due scan: WHERE status IN (…) AND run_at <= ? ORDER BY priority DESC, run_at
        CREATE INDEX IF NOT EXISTS idx_tasks_status_run_at ON tasks (status, run_at);
        -- Stuck scan: WHERE status = 'STARTED' AND started_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_status_started ON tasks (status, started_at);
        -- Lost hand-off scan: WHERE status = 'ENQUEUED' AND updated_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks (status, updated_at);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     TEXT    NOT NULL REFERENCES tasks (id),
            reason      TEXT    NOT NULL,
            error       TEXT,
            payload     TEXT    NOT NULL DEFAULT '{}',
            created_at  TEXT    NOT NULL
        );

        -- A task dies at most once.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_dead_letters_task ON dead_letters (task_id);
        ",
    )?;
    Ok(())
}
