use colloquy_types::Message;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::rows::{insert_event, upsert_message, EventRow};
use crate::{ConnectionManager, StoreConfig, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Events,
    Messages,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Events => "events",
            Table::Messages => "messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingRow {
    Event(EventRow),
    Message(Message),
}

impl PendingRow {
    pub fn table(&self) -> Table {
        match self {
            PendingRow::Event(_) => Table::Events,
            PendingRow::Message(_) => Table::Messages,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub pending: usize,
    pub flushed_rows: u64,
    pub dropped_rows: u64,
    pub failed_flushes: u64,
}

struct Buffers {
    tables: BTreeMap<Table, Vec<PendingRow>>,
    last_flush: Instant,
    stopping: bool,
}

impl Buffers {
    fn pending(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    fn any_full(&self, batch_size: usize) -> bool {
        self.tables.values().any(|rows| rows.len() >= batch_size)
    }
}

struct Shared {
    connections: Arc<ConnectionManager>,
    batch_size: usize,
    batch_timeout: Duration,
    state: Mutex<Buffers>,
    wake: Condvar,
    flush_lock: Mutex<()>,
    flushed_rows: AtomicU64,
    dropped_rows: AtomicU64,
    failed_flushes: AtomicU64,
}

impl Shared {
    /// Blocks until a flush is due. Returns `Some(true)` once stopping, `None`
    /// if the buffer lock was poisoned.
    fn wait_for_work(&self) -> Option<bool> {
        let mut state = self.state.lock().ok()?;
        loop {
            if state.stopping || state.any_full(self.batch_size) {
                return Some(state.stopping);
            }
            let elapsed = state.last_flush.elapsed();
            if elapsed >= self.batch_timeout {
                if state.pending() > 0 {
                    return Some(false);
                }
                state.last_flush = Instant::now();
                continue;
            }
            let wait = self.batch_timeout - elapsed;
            state = self.wake.wait_timeout(state, wait).ok()?.0;
        }
    }

    fn flush(&self) -> StoreResult<FlushReport> {
        let _flush = self.flush_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let drained = {
            let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
            state.last_flush = Instant::now();
            std::mem::take(&mut state.tables)
        };

        let mut report = FlushReport::default();
        for (table, rows) in drained {
            if rows.is_empty() {
                continue;
            }
            let count = rows.len();
            match self.write_table(&rows) {
                Ok(()) => {
                    report.flushed += count;
                    self.flushed_rows.fetch_add(count as u64, Ordering::Relaxed);
                    debug!(table = table.as_str(), rows = count, "flushed batch");
                }
                Err(err) => {
                    report.dropped += count;
                    self.dropped_rows.fetch_add(count as u64, Ordering::Relaxed);
                    self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    warn!(table = table.as_str(), rows = count, error = %err, "discarding batch after failed flush");
                }
            }
        }
        Ok(report)
    }

    fn write_table(&self, rows: &[PendingRow]) -> StoreResult<()> {
        self.connections.transaction(|tx| {
            for row in rows {
                match row {
                    PendingRow::Event(event) => {
                        insert_event(tx, event)?;
                    }
                    PendingRow::Message(message) => {
                        upsert_message(tx, message)?;
                    }
                }
            }
            Ok(())
        })
    }
}

/// Buffers rows per table and writes them from a background thread, one
/// transaction per table per flush. A batch whose transaction fails is
/// dropped and counted, never re-queued.
pub struct BatchWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<(JoinHandle<()>, Receiver<()>)>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("batch_size", &self.shared.batch_size)
            .field("batch_timeout", &self.shared.batch_timeout)
            .finish()
    }
}

impl BatchWriter {
    pub fn new(connections: Arc<ConnectionManager>, config: &StoreConfig) -> StoreResult<Self> {
        let shared = Arc::new(Shared {
            connections,
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            state: Mutex::new(Buffers {
                tables: BTreeMap::new(),
                last_flush: Instant::now(),
                stopping: false,
            }),
            wake: Condvar::new(),
            flush_lock: Mutex::new(()),
            flushed_rows: AtomicU64::new(0),
            dropped_rows: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        });
        let (done_tx, done_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("colloquy-batch-writer".to_string())
            .spawn(move || run_worker(worker_shared, done_tx))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some((handle, done_rx))),
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Buffers one row. Never touches the database.
    pub fn enqueue(&self, row: PendingRow) -> StoreResult<()> {
        let mut state = self.shared.state.lock().map_err(|_| StoreError::Poisoned)?;
        if state.stopping {
            return Err(StoreError::Closed);
        }
        let table = row.table();
        let rows = state.tables.entry(table).or_default();
        rows.push(row);
        if rows.len() >= self.shared.batch_size {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Writes everything buffered so far on the calling thread.
    pub fn flush(&self) -> StoreResult<FlushReport> {
        self.shared.flush()
    }

    pub fn pending(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.pending())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            pending: self.pending(),
            flushed_rows: self.shared.flushed_rows.load(Ordering::Relaxed),
            dropped_rows: self.shared.dropped_rows.load(Ordering::Relaxed),
            failed_flushes: self.shared.failed_flushes.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.stopping)
            .unwrap_or(true)
    }

    /// Stops accepting rows, lets the worker run one last flush and waits up
    /// to `stop_timeout` for it. A worker that overruns is detached.
    pub fn stop(&self) -> StoreResult<()> {
        {
            let mut state = self.shared.state.lock().map_err(|_| StoreError::Poisoned)?;
            state.stopping = true;
        }
        self.shared.wake.notify_all();

        let worker = self.worker.lock().map_err(|_| StoreError::Poisoned)?.take();
        let Some((handle, done)) = worker else {
            return Ok(());
        };
        match done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("batch writer thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "batch writer did not stop in time; detaching"
                );
            }
        }
        Ok(())
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop batch writer");
        }
    }
}

fn run_worker(shared: Arc<Shared>, done: Sender<()>) {
    while let Some(stopping) = shared.wait_for_work() {
        if let Err(err) = shared.flush() {
            warn!(error = %err, "batch flush aborted");
        }
        if stopping {
            break;
        }
    }
    info!("batch writer stopped");
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RetryPolicy, SchemaManager};
    use chrono::Utc;

    fn fixture(batch_size: usize, timeout: Duration) -> (tempfile::TempDir, Arc<ConnectionManager>, BatchWriter) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("batch.db"))
            .with_batch_size(batch_size)
            .with_batch_timeout(timeout);
        let connections = Arc::new(ConnectionManager::open(&config).unwrap());
        SchemaManager::new(connections.path())
            .ensure_schema(&connections)
            .unwrap();
        let writer = BatchWriter::new(Arc::clone(&connections), &config).unwrap();
        (dir, connections, writer)
    }

    fn event(id: &str, sequence: i64) -> PendingRow {
        PendingRow::Event(EventRow {
            event_id: id.to_string(),
            timestamp: 1_700_000_000_000 + sequence,
            event_type: "message_complete".to_string(),
            conversation_id: Some("c1".to_string()),
            experiment_id: None,
            payload: r#"{"agent_id":"agent_a","tokens":3}"#.to_string(),
            sequence,
        })
    }

    fn count(connections: &ConnectionManager, table: &str) -> i64 {
        let row = connections
            .fetch_one(&format!("SELECT COUNT(*) AS n FROM {table}"), &[])
            .unwrap()
            .unwrap();
        row["n"].as_i64().unwrap()
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn full_buffer_wakes_the_worker() {
        let (_dir, connections, writer) = fixture(2, Duration::from_secs(60));
        writer.enqueue(event("e1", 1)).unwrap();
        writer.enqueue(event("e2", 2)).unwrap();
        assert!(wait_for(|| writer.stats().flushed_rows == 2));
        assert_eq!(count(&connections, "events"), 2);
    }

    #[test]
    fn timeout_flushes_partial_buffer() {
        let (_dir, connections, writer) = fixture(100, Duration::from_millis(50));
        writer
            .enqueue(PendingRow::Message(Message {
                conversation_id: "c1".to_string(),
                turn_number: 1,
                agent_id: "agent_a".to_string(),
                content: "hello".to_string(),
                token_count: Some(2),
                model: None,
                created_at: Utc::now(),
            }))
            .unwrap();
        assert!(wait_for(|| count(&connections, "messages") == 1));
        assert_eq!(writer.pending(), 0);
    }

    #[test]
    fn failed_flush_discards_only_its_batch() {
        let (_dir, connections, writer) = fixture(100, Duration::from_secs(60));
        writer.enqueue(event("e1", 1)).unwrap();
        assert_eq!(writer.flush().unwrap().flushed, 1);

        writer.enqueue(event("e2", 2)).unwrap();
        writer.enqueue(event("e1", 3)).unwrap();
        writer.enqueue(event("e3", 4)).unwrap();
        let failed = writer.flush().unwrap();
        assert_eq!(failed, FlushReport { flushed: 0, dropped: 3 });
        assert_eq!(count(&connections, "events"), 1);

        writer.enqueue(event("e4", 5)).unwrap();
        assert_eq!(writer.flush().unwrap().flushed, 1);
        assert_eq!(count(&connections, "events"), 2);

        let stats = writer.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.dropped_rows, 3);
        assert_eq!(stats.flushed_rows, 2);
    }

    #[test]
    fn stop_flushes_remaining_rows_and_rejects_new_ones() {
        let (_dir, connections, writer) = fixture(100, Duration::from_secs(60));
        for (idx, id) in ["a", "b", "c"].iter().enumerate() {
            writer.enqueue(event(id, idx as i64 + 1)).unwrap();
        }
        writer.stop().unwrap();
        assert_eq!(count(&connections, "events"), 3);
        assert!(matches!(writer.enqueue(event("d", 4)), Err(StoreError::Closed)));
        writer.stop().unwrap();
    }

    #[test]
    fn stop_detaches_a_worker_stuck_behind_a_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.db");
        let mut config = StoreConfig::new(path.clone())
            .with_batch_size(100)
            .with_batch_timeout(Duration::from_secs(60))
            .with_busy_timeout(Duration::from_millis(500))
            .with_retry(RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            });
        config.stop_timeout_ms = 50;
        let connections = Arc::new(ConnectionManager::open(&config).unwrap());
        SchemaManager::new(connections.path())
            .ensure_schema(&connections)
            .unwrap();
        let writer = BatchWriter::new(Arc::clone(&connections), &config).unwrap();
        writer.enqueue(event("e1", 1)).unwrap();

        let locker = rusqlite::Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let started = Instant::now();
        writer.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(writer.is_stopped());
        assert!(matches!(writer.enqueue(event("e2", 2)), Err(StoreError::Closed)));
        locker.execute_batch("ROLLBACK").unwrap();
        writer.stop().unwrap();
    }
}
