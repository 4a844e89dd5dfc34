//! Retriable SQLite transactions.
//!
//! The single primitive exposed here is [`Store::transact_retry`]: run
//! a closure inside BEGIN/COMMIT, and if it fails with an error the
//! caller's error type classifies as contention, roll back and try
//! again under a jittered exponential backoff. Everything else —
//! schema, queries, semantics — belongs to the layer above.
//!
//! SQLite is a bit of an edge case as a backend. It only permits a
//! single writer, so "deadlock" here really means the busy/locked
//! family: `SQLITE_BUSY`, `SQLITE_LOCKED`, and `SQLITE_PROTOCOL`
//! (which SQLite itself only returns after its own retry logic gave
//! up).

use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{Connection, ErrorCode, Transaction};
use std::path::Path;
use std::time::Duration;

/// Default number of attempts for a retriable transaction.
pub const DEFAULT_TRIES: u32 = 3;

/// Exclusive upper bound of the random exponent draw.
const BACKOFF_CEILING: u32 = 8;

/// Base delay unit for the backoff schedule.
const BACKOFF_SCALE_MS: u64 = 10;

/// A backoff schedule: attempt index (0-based) to sleep duration.
pub type Backoff = Box<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retry classification implemented by the caller's error type.
pub trait Retriable: Sized {
    /// Whether this error is backend contention worth retrying.
    fn is_contention(&self) -> bool;

    /// Wraps the final error once the retry budget is spent, recording
    /// the attempt count.
    fn into_exhausted(self, tries: u32) -> Self;
}

/// The deadlock predicate for the SQLite backend.
pub fn is_deadlock(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::FileLockingProtocolFailed
        )
    )
}

/// Truncated binary-exponential backoff with per-try jitter:
/// `2^max(try, uniform[0, 8)) * 10ms`.
pub fn binary_exponential_backoff() -> Backoff {
    Box::new(|attempt| {
        let c = rand::thread_rng().gen_range(0..BACKOFF_CEILING).max(attempt);
        Duration::from_millis(BACKOFF_SCALE_MS << c)
    })
}

/// An embedded database handle with a retry policy.
pub struct Store {
    conn: Mutex<Connection>,
    tries: u32,
    backoff: Backoff,
}

impl Store {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Store> {
        Store::from_conn(Connection::open(path)?)
    }

    /// Opens a private in-memory database. Test fixture.
    pub fn open_in_memory() -> rusqlite::Result<Store> {
        Store::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> rusqlite::Result<Store> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 60_000)?;
        Ok(Store {
            conn: Mutex::new(conn),
            tries: DEFAULT_TRIES,
            backoff: binary_exponential_backoff(),
        })
    }

    /// Overrides the retry budget. Must be at least 1.
    pub fn with_tries(mut self, tries: u32) -> Store {
        assert!(tries >= 1, "tries must be 1 or greater");
        self.tries = tries;
        self
    }

    /// Overrides the backoff schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Store {
        self.backoff = backoff;
        self
    }

    /// Runs `f` inside a single transaction. On success the
    /// transaction commits; on error it rolls back and the closure's
    /// error is returned. A failing rollback is logged, never
    /// returned, so the caller keeps the root cause.
    pub fn transact<T, E>(
        &self,
        f: &mut impl FnMut(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(E::from)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` via [`Store::transact`], retrying on contention up to
    /// the configured number of attempts with backoff in between. A
    /// non-contention error is returned verbatim; an exhausted budget
    /// wraps the last error with the attempt count.
    pub fn transact_retry<T, E>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error> + Retriable,
    {
        let mut last = None;
        for attempt in 0..self.tries {
            match self.transact(&mut f) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_contention() {
                        return Err(err);
                    }
                    if attempt != self.tries - 1 {
                        std::thread::sleep((self.backoff)(attempt));
                    }
                    last = Some(err);
                }
            }
        }

        Err(last
            .expect("tries is at least 1, so at least one attempt ran")
            .into_exhausted(self.tries))
    }
}
