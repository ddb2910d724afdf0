use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};

/// Explicit handle to the task store.
///
/// Cloning is cheap and shares the same connection. Components that must not
/// contend with each other (HTTP API, engine, workers) should each get their
/// own handle from [`Store::open`]; conditional updates keep them consistent.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        debug!(path, "store connection opened");
        Self::new(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    /// Run read-only statements against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so a read-decide-write sequence in
    /// `f` cannot interleave with another connection's writes. The
    /// transaction commits only if `f` returns `Ok`; on error it is rolled
    /// back when dropped.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Block until the database at `path` accepts a trivial query, or give up.
///
/// Retries every `interval` until `max_wait` has elapsed. Used once at
/// startup, before the first tick.
pub async fn wait_for_store(path: &str, max_wait: Duration, interval: Duration) -> Result<()> {
    let deadline = Instant::now() + max_wait;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let last_error = match probe(path) {
            Ok(()) => {
                info!(path, attempt, "store is ready");
                return Ok(());
            }
            Err(e) => e.to_string(),
        };

        if Instant::now() >= deadline {
            return Err(SchedulerError::StoreUnavailable {
                waited_secs: max_wait.as_secs(),
                last_error,
            });
        }
        warn!(path, attempt, error = %last_error, "store not ready, retrying");
        tokio::time::sleep(interval).await;
    }
}

fn probe(path: &str) -> rusqlite::Result<()> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// 0000-01-01T00:00:00Z, in microseconds since the epoch.
const EARLIEST_STORABLE_MICROS: i64 = -62_167_219_200_000_000;
/// 9999-12-31T23:59:59.999999Z, in microseconds since the epoch.
const LATEST_STORABLE_MICROS: i64 = 253_402_300_799_999_999;

/// First instant [`fmt_ts`] writes at fixed width.
pub fn earliest_storable() -> DateTime<Utc> {
    DateTime::<Utc>::default() + ChronoDuration::microseconds(EARLIEST_STORABLE_MICROS)
}

/// Last instant [`fmt_ts`] writes at fixed width.
pub fn latest_storable() -> DateTime<Utc> {
    DateTime::<Utc>::default() + ChronoDuration::microseconds(LATEST_STORABLE_MICROS)
}

/// Whether `dt` falls in the years 0000..=9999.
pub fn is_storable(dt: &DateTime<Utc>) -> bool {
    (earliest_storable()..=latest_storable()).contains(dt)
}

/// Pin `dt` into the years 0000..=9999.
pub fn clamp_storable(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.clamp(earliest_storable(), latest_storable())
}

/// Fixed-width RFC 3339 in UTC (`2026-01-02T03:04:05.000006Z`).
///
/// Every timestamp column uses this format so that string comparison in SQL
/// matches chronological order. Only instants in the years 0000..=9999 keep
/// the fixed width; callers clamp or reject anything outside.
pub fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexically() {
        let a = parse_ts("2026-01-01T00:00:09Z").unwrap();
        let b = parse_ts("2026-01-01T00:00:10.5Z").unwrap();
        assert!(fmt_ts(&a) < fmt_ts(&b));
        assert_eq!(fmt_ts(&a).len(), fmt_ts(&b).len());
        assert_eq!(parse_ts(&fmt_ts(&b)).unwrap(), b);
    }

    #[test]
    fn storable_bounds_keep_fixed_width() {
        let early = fmt_ts(&earliest_storable());
        let late = fmt_ts(&latest_storable());
        assert_eq!(early, "0000-01-01T00:00:00.000000Z");
        assert_eq!(late, "9999-12-31T23:59:59.999999Z");
        assert_eq!(parse_ts(&late).unwrap(), latest_storable());

        assert_eq!(clamp_storable(DateTime::<Utc>::MAX_UTC), latest_storable());
        assert_eq!(clamp_storable(DateTime::<Utc>::MIN_UTC), earliest_storable());
        assert!(!is_storable(&DateTime::<Utc>::MAX_UTC));
        let now = Utc::now();
        assert_eq!(clamp_storable(now), now);
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let res: Result<()> = store.write(|tx| {
            tx.execute(
                "INSERT INTO tasks (id, name, run_at, created_at, updated_at)
                 VALUES ('x', 'n', 'a', 'a', 'a')",
                [],
            )?;
            Err(SchedulerError::InvalidTask("abort".into()))
        });
        assert!(res.is_err());

        let n: i64 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn wait_for_store_succeeds_on_memory_db() {
        wait_for_store(":memory:", Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_store_gives_up_after_deadline() {
        let err = wait_for_store(
            "/nonexistent-taskq-dir/sub/taskq.db",
            Duration::from_millis(30),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SchedulerError::StoreUnavailable { .. }));
    }
}
