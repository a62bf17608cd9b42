use colloquy_types::JsonMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, Row, TransactionBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{RetryPolicy, StoreConfig, StoreError, StoreResult};

/// A result row keyed by column name.
pub type QueryRow = JsonMap;

const READ_ONLY_ATTEMPTS: u32 = 2;

/// How a failed database call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Another writer holds the file lock.
    Lock,
    /// Pool exhaustion or an I/O hiccup.
    Transient,
    Fatal,
}

pub fn classify(err: &StoreError) -> Failure {
    match err {
        StoreError::TransientLock(_) => Failure::Lock,
        StoreError::Pool(_) => Failure::Transient,
        StoreError::Database(rusqlite::Error::SqliteFailure(code, message)) => match code.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Failure::Lock,
            ErrorCode::SystemIoFailure => Failure::Transient,
            _ if mentions_lock(message.as_deref().unwrap_or_default()) => Failure::Lock,
            _ => Failure::Fatal,
        },
        StoreError::Database(other) if mentions_lock(&other.to_string()) => Failure::Lock,
        _ => Failure::Fatal,
    }
}

fn mentions_lock(message: &str) -> bool {
    message.contains("database is locked")
}

/// Pooled access to one SQLite file. Every call goes through the retry loop
/// in [`ConnectionManager::with_connection`].
pub struct ConnectionManager {
    path: PathBuf,
    read_only: bool,
    retry: RetryPolicy,
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl ConnectionManager {
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let path = config.path.clone();
        let read_only = config.read_only;
        if read_only {
            if !path.exists() {
                return Err(StoreError::Connection(format!(
                    "database file {} does not exist; cannot open read-only",
                    path.display()
                )));
            }
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::default()
        };
        let busy_timeout = config.busy_timeout();
        let manager = SqliteConnectionManager::file(&path)
            .with_flags(flags)
            .with_init(move |conn| configure_connection(conn, read_only, busy_timeout));
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connection_timeout())
            .build(manager)
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        debug!(path = %path.display(), read_only, pool_size = config.pool_size, "opened connection pool");

        Ok(Self {
            path,
            read_only,
            retry: config.retry.clone(),
            pool: RwLock::new(Some(pool)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.pool.read().map(|guard| guard.is_none()).unwrap_or(true)
    }

    fn pool(&self) -> StoreResult<Pool<SqliteConnectionManager>> {
        let guard = self.pool.read().map_err(|_| StoreError::Poisoned)?;
        guard.clone().ok_or(StoreError::Closed)
    }

    /// Runs `f` on a pooled connection, retrying lock contention and
    /// transient failures until the retry budget is spent.
    pub fn with_connection<F, T>(&self, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&mut Connection) -> StoreResult<T>,
    {
        let max_attempts = if self.read_only {
            self.retry.max_attempts.min(READ_ONLY_ATTEMPTS)
        } else {
            self.retry.max_attempts
        };
        let mut attempt = 0;
        loop {
            let pool = self.pool()?;
            let result = pool
                .get()
                .map_err(StoreError::from)
                .and_then(|mut conn| f(&mut conn));
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;
            let failure = classify(&err);
            if failure == Failure::Fatal {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempt, error = %err, "database retries exhausted");
                return Err(StoreError::Connection(format!(
                    "gave up after {attempt} attempts: {err}"
                )));
            }
            let delay = match failure {
                Failure::Lock => self.retry.lock_delay(),
                _ => self.retry.backoff_delay(attempt - 1),
            };
            warn!(attempt, ?failure, delay_ms = delay.as_millis() as u64, error = %err, "retrying database operation");
            std::thread::sleep(delay);
        }
    }

    /// Runs `f` inside one transaction. Writers take the lock up front so a
    /// busy file is reported before any work is done.
    pub fn transaction<F, T>(&self, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&Connection) -> StoreResult<T>,
    {
        let behavior = if self.read_only {
            TransactionBehavior::Deferred
        } else {
            TransactionBehavior::Immediate
        };
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(behavior)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    pub fn fetch_one(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<QueryRow>> {
        Ok(self.fetch_all(sql, params)?.into_iter().next())
    }

    pub fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<QueryRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                row_to_json(row, &names)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
        self.with_connection(|conn| Ok(conn.execute(sql, params_from_iter(params.iter()))?))
    }

    /// Executes `sql` once per parameter set, all in one transaction.
    pub fn execute_many(&self, sql: &str, batches: &[Vec<SqlValue>]) -> StoreResult<usize> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare_cached(sql)?;
            let mut changed = 0;
            for params in batches {
                changed += stmt.execute(params_from_iter(params.iter()))?;
            }
            Ok(changed)
        })
    }

    /// Drops the pool. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> StoreResult<bool> {
        let mut guard = self.pool.write().map_err(|_| StoreError::Poisoned)?;
        let was_open = guard.take().is_some();
        if was_open {
            debug!(path = %self.path.display(), "closed connection pool");
        }
        Ok(was_open)
    }
}

fn configure_connection(
    conn: &mut Connection,
    read_only: bool,
    busy_timeout: Duration,
) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    if !read_only {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
    }
    Ok(())
}

fn row_to_json(row: &Row<'_>, names: &[String]) -> rusqlite::Result<QueryRow> {
    let mut out = QueryRow::new();
    for (idx, name) in names.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(number) => Value::from(number),
            ValueRef::Real(number) => serde_json::Number::from_f64(number)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
            ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}
