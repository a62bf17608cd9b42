use chrono::Utc;
use colloquy_types::SchemaMigration;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::rows::{from_millis, to_millis};
use crate::{ConnectionManager, StoreError, StoreResult};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        execution_time_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS experiments (
        experiment_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        config TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        total_conversations INTEGER NOT NULL DEFAULT 0,
        completed_conversations INTEGER NOT NULL DEFAULT 0,
        failed_conversations INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    );

    CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        experiment_id TEXT NOT NULL,
        status TEXT NOT NULL,
        end_reason TEXT,
        agent_a_model TEXT,
        agent_b_model TEXT,
        agent_a_temperature REAL,
        agent_b_temperature REAL,
        initial_prompt TEXT,
        max_turns INTEGER,
        config TEXT NOT NULL,
        total_turns INTEGER NOT NULL DEFAULT 0,
        final_convergence_score REAL,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS conversations_experiment
        ON conversations(experiment_id);

    CREATE TABLE IF NOT EXISTS events (
        event_id TEXT PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        conversation_id TEXT,
        experiment_id TEXT,
        payload TEXT NOT NULL,
        sequence INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS events_conversation_order
        ON events(conversation_id, timestamp, sequence);
    CREATE INDEX IF NOT EXISTS events_experiment
        ON events(experiment_id, timestamp);

    CREATE TABLE IF NOT EXISTS turn_metrics (
        conversation_id TEXT NOT NULL,
        turn_number INTEGER NOT NULL,
        convergence_score REAL,
        vocabulary_overlap REAL,
        structural_similarity REAL,
        semantic_similarity REAL,
        sentiment_similarity REAL,
        formality_similarity REAL,
        pronoun_similarity REAL,
        question_alignment REAL,
        repetition_rate_a REAL,
        repetition_rate_b REAL,
        length_ratio REAL,
        message_a_length INTEGER,
        message_b_length INTEGER,
        message_a_word_count INTEGER,
        message_b_word_count INTEGER,
        message_a_tokens INTEGER,
        message_b_tokens INTEGER,
        shared_vocabulary_size INTEGER,
        dominant_style TEXT,
        vocabulary_a TEXT NOT NULL DEFAULT '[]',
        vocabulary_b TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        PRIMARY KEY (conversation_id, turn_number)
    );

    CREATE TABLE IF NOT EXISTS messages (
        conversation_id TEXT NOT NULL,
        turn_number INTEGER NOT NULL,
        agent_id TEXT NOT NULL,
        content TEXT NOT NULL,
        token_count INTEGER,
        model TEXT,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (conversation_id, turn_number, agent_id)
    );
";

/// One versioned schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: SCHEMA_SQL,
    },
    Migration {
        version: 2,
        name: "turn_metrics_convergence_index",
        sql: "CREATE INDEX IF NOT EXISTS turn_metrics_convergence
                  ON turn_metrics(conversation_id, convergence_score);",
    },
    Migration {
        version: 3,
        name: "experiment_summary_view",
        sql: "CREATE VIEW IF NOT EXISTS experiment_summary AS
              SELECT c.experiment_id AS experiment_id,
                     COUNT(*) AS conversations,
                     SUM(CASE WHEN c.status = 'completed' THEN 1 ELSE 0 END) AS completed,
                     SUM(CASE WHEN c.status = 'failed' THEN 1 ELSE 0 END) AS failed,
                     SUM(CASE WHEN c.status = 'interrupted' THEN 1 ELSE 0 END) AS interrupted,
                     AVG(c.total_turns) AS avg_turns,
                     AVG(c.final_convergence_score) AS avg_final_convergence,
                     (SELECT AVG(t.convergence_score)
                        FROM turn_metrics t
                        JOIN conversations c2 ON c2.conversation_id = t.conversation_id
                       WHERE c2.experiment_id = c.experiment_id) AS avg_turn_convergence
                FROM conversations c
               GROUP BY c.experiment_id;",
    },
    Migration {
        version: 4,
        name: "import_log",
        sql: "CREATE TABLE IF NOT EXISTS import_log (
                  source TEXT NOT NULL,
                  experiment_id TEXT NOT NULL,
                  imported_at INTEGER NOT NULL,
                  events_imported INTEGER NOT NULL,
                  conversations_imported INTEGER NOT NULL,
                  PRIMARY KEY (source, experiment_id)
              );",
    },
];

pub const LATEST_VERSION: i64 = 4;

pub(crate) const MANAGED_TABLES: &[&str] = &[
    "events",
    "turn_metrics",
    "messages",
    "conversations",
    "experiments",
    "import_log",
    "schema_migrations",
];

const MANAGED_VIEWS: &[&str] = &["experiment_summary"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: i64,
    pub name: String,
}

/// Applies DDL and versioned migrations to one database file. The expensive
/// DDL pass runs at most once per manager.
pub struct SchemaManager {
    key: PathBuf,
    initialized: AtomicBool,
    guard: Mutex<()>,
    migrations: &'static [Migration],
}

impl std::fmt::Debug for SchemaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaManager")
            .field("key", &self.key)
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .finish()
    }
}

impl SchemaManager {
    pub fn new(path: &Path) -> Self {
        Self::with_migrations(path, MIGRATIONS)
    }

    pub fn with_migrations(path: &Path, migrations: &'static [Migration]) -> Self {
        Self {
            key: resolve_path(path),
            initialized: AtomicBool::new(false),
            guard: Mutex::new(()),
            migrations,
        }
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Creates every table if missing. Returns `false` when the pass already
    /// ran for this file.
    #[instrument(skip_all, fields(path = %self.key.display()))]
    pub fn ensure_schema(&self, connections: &ConnectionManager) -> StoreResult<bool> {
        if self.is_initialized() {
            return Ok(false);
        }
        self.check_target(connections)?;
        let _guard = self.guard.lock().map_err(|_| StoreError::Poisoned)?;
        if self.is_initialized() {
            return Ok(false);
        }
        connections
            .with_connection(|conn| Ok(conn.execute_batch(SCHEMA_SQL)?))
            .map_err(schema_error)?;
        self.initialized.store(true, Ordering::Release);
        debug!("schema ensured");
        Ok(true)
    }

    /// Applies pending migrations in ascending order, one transaction each.
    #[instrument(skip_all, fields(path = %self.key.display()))]
    pub fn migrate(&self, connections: &ConnectionManager) -> StoreResult<MigrationReport> {
        self.ensure_schema(connections)?;
        let _guard = self.guard.lock().map_err(|_| StoreError::Poisoned)?;
        let from_version = self.current_version(connections)?;
        let mut pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|migration| migration.version > from_version)
            .collect();
        pending.sort_by_key(|migration| migration.version);

        let mut applied = Vec::new();
        for migration in pending {
            let started = Instant::now();
            let recorded = connections
                .transaction(|tx| {
                    if current_version_on(tx)? >= migration.version {
                        return Ok(false);
                    }
                    tx.execute_batch(migration.sql)?;
                    let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                    tx.execute(
                        "INSERT INTO schema_migrations (version, name, applied_at, execution_time_ms)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![migration.version, migration.name, to_millis(Utc::now()), elapsed],
                    )?;
                    Ok(true)
                })
                .map_err(|err| {
                    StoreError::Schema(format!(
                        "migration {} ({}) failed: {}",
                        migration.version, migration.name, err
                    ))
                })?;
            if recorded {
                info!(version = migration.version, name = migration.name, "applied schema migration");
                applied.push(migration.version);
            }
        }

        Ok(MigrationReport {
            from_version,
            to_version: self.current_version(connections)?,
            applied,
        })
    }

    /// Drops every managed table and view, then recreates the base schema.
    #[instrument(skip_all, fields(path = %self.key.display()))]
    pub fn reset(&self, connections: &ConnectionManager) -> StoreResult<()> {
        self.check_target(connections)?;
        {
            let _guard = self.guard.lock().map_err(|_| StoreError::Poisoned)?;
            connections
                .transaction(|tx| {
                    for view in MANAGED_VIEWS {
                        tx.execute_batch(&format!("DROP VIEW IF EXISTS {view};"))?;
                    }
                    for table in MANAGED_TABLES {
                        tx.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
                    }
                    Ok(())
                })
                .map_err(schema_error)?;
            self.initialized.store(false, Ordering::Release);
        }
        info!("dropped managed schema objects");
        self.ensure_schema(connections)?;
        Ok(())
    }

    pub fn current_version(&self, connections: &ConnectionManager) -> StoreResult<i64> {
        connections.with_connection(|conn| current_version_on(conn))
    }

    pub fn applied_migrations(
        &self,
        connections: &ConnectionManager,
    ) -> StoreResult<Vec<SchemaMigration>> {
        connections.with_connection(|conn| {
            if !table_exists(conn, "schema_migrations")? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT version, name, applied_at, execution_time_ms
                 FROM schema_migrations ORDER BY version",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SchemaMigration {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    applied_at: from_millis(row.get(2)?),
                    execution_time_ms: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn pending_migrations(
        &self,
        connections: &ConnectionManager,
    ) -> StoreResult<Vec<PendingMigration>> {
        let current = self.current_version(connections)?;
        let mut pending: Vec<PendingMigration> = self
            .migrations
            .iter()
            .filter(|migration| migration.version > current)
            .map(|migration| PendingMigration {
                version: migration.version,
                name: migration.name.to_string(),
            })
            .collect();
        pending.sort_by_key(|migration| migration.version);
        Ok(pending)
    }

    fn check_target(&self, connections: &ConnectionManager) -> StoreResult<()> {
        if connections.is_read_only() {
            return Err(StoreError::Schema(
                "cannot change the schema of a read-only database".to_string(),
            ));
        }
        let target = resolve_path(connections.path());
        if target != self.key {
            return Err(StoreError::InvalidInput(format!(
                "schema manager for {} cannot manage {}",
                self.key.display(),
                target.display()
            )));
        }
        Ok(())
    }
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn current_version_on(conn: &Connection) -> StoreResult<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?)
}

fn resolve_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn schema_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Database(inner) => StoreError::Schema(inner.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;

    fn open(dir: &tempfile::TempDir) -> ConnectionManager {
        ConnectionManager::open(&StoreConfig::new(dir.path().join("schema.db"))).unwrap()
    }

    #[test]
    fn ensure_schema_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let connections = open(&dir);
        let schema = SchemaManager::new(connections.path());
        assert!(schema.ensure_schema(&connections).unwrap());
        assert!(!schema.ensure_schema(&connections).unwrap());
        let exists = connections
            .with_connection(|conn| table_exists(conn, "events"))
            .unwrap();
        assert!(exists);
    }

    #[test]
    fn migrate_applies_each_version_once() {
        let dir = tempfile::tempdir().unwrap();
        let connections = open(&dir);
        let schema = SchemaManager::new(connections.path());

        let first = schema.migrate(&connections).unwrap();
        assert_eq!(first.from_version, 0);
        assert_eq!(first.to_version, LATEST_VERSION);
        assert_eq!(first.applied, vec![1, 2, 3, 4]);

        let second = schema.migrate(&connections).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.from_version, LATEST_VERSION);
        assert!(schema.pending_migrations(&connections).unwrap().is_empty());

        let history = schema.applied_migrations(&connections).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].name, "experiment_summary_view");
    }

    static BROKEN: &[Migration] = &[
        Migration {
            version: 1,
            name: "baseline",
            sql: SCHEMA_SQL,
        },
        Migration {
            version: 2,
            name: "broken",
            sql: "CREATE TABLE half_done (id INTEGER); CREATE TABLE oops (",
        },
    ];

    #[test]
    fn failed_migration_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let connections = open(&dir);
        let schema = SchemaManager::with_migrations(connections.path(), BROKEN);

        let err = schema.migrate(&connections).unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));
        assert_eq!(schema.current_version(&connections).unwrap(), 1);
        let half_done = connections
            .with_connection(|conn| table_exists(conn, "half_done"))
            .unwrap();
        assert!(!half_done);
    }

    #[test]
    fn reset_drops_rows_and_recreates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let connections = open(&dir);
        let schema = SchemaManager::new(connections.path());
        schema.migrate(&connections).unwrap();
        connections
            .execute(
                "INSERT INTO experiments (experiment_id, name, config, status, created_at)
                 VALUES ('e1', 'T', '{}', 'created', 0)",
                &[],
            )
            .unwrap();

        schema.reset(&connections).unwrap();
        let count = connections
            .fetch_one("SELECT COUNT(*) AS n FROM experiments", &[])
            .unwrap()
            .unwrap();
        assert_eq!(count["n"], serde_json::json!(0));
        assert_eq!(schema.current_version(&connections).unwrap(), 0);
        assert_eq!(schema.migrate(&connections).unwrap().to_version, LATEST_VERSION);
    }
}
