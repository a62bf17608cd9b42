//! Administrative entry points. Each call opens its own pool, does one job
//! and returns a serializable report for the caller to render.

use colloquy_types::SchemaMigration;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::schema::{table_exists, MANAGED_TABLES};
use crate::{
    ConnectionManager, MigrationReport, PendingMigration, SchemaManager, StoreConfig, StoreError,
    StoreResult, LATEST_VERSION,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateReport {
    pub path: PathBuf,
    pub schema_version: i64,
    pub applied: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub path: PathBuf,
    pub dropped_tables: Vec<String>,
    pub schema_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub path: PathBuf,
    pub exists: bool,
    pub schema_version: i64,
    pub latest_version: i64,
    pub pending: Vec<PendingMigration>,
    pub applied: Vec<SchemaMigration>,
    pub row_counts: BTreeMap<String, i64>,
}

/// Creates a new database file with the full schema. An existing file is
/// left untouched and reported as an error.
pub fn create_fresh(path: &Path) -> StoreResult<CreateReport> {
    if path.exists() {
        return Err(StoreError::InvalidInput(format!(
            "{} already exists",
            path.display()
        )));
    }
    let connections = ConnectionManager::open(&StoreConfig::new(path))?;
    let schema = SchemaManager::new(connections.path());
    let report = schema.migrate(&connections)?;
    connections.close()?;
    info!(path = %path.display(), version = report.to_version, "created database");
    Ok(CreateReport {
        path: path.to_path_buf(),
        schema_version: report.to_version,
        applied: report.applied,
    })
}

pub fn migrate(path: &Path) -> StoreResult<MigrationReport> {
    let connections = open_existing(path)?;
    let report = SchemaManager::new(connections.path()).migrate(&connections)?;
    connections.close()?;
    Ok(report)
}

/// Drops every managed table and view, then rebuilds the schema at the
/// latest version.
pub fn reset(path: &Path) -> StoreResult<ResetReport> {
    let connections = open_existing(path)?;
    let dropped_tables = connections.with_connection(|conn| {
        let mut present = Vec::new();
        for table in MANAGED_TABLES {
            if table_exists(conn, table)? {
                present.push(table.to_string());
            }
        }
        Ok(present)
    })?;
    let schema = SchemaManager::new(connections.path());
    schema.reset(&connections)?;
    let report = schema.migrate(&connections)?;
    connections.close()?;
    info!(path = %path.display(), tables = dropped_tables.len(), "reset database");
    Ok(ResetReport {
        path: path.to_path_buf(),
        dropped_tables,
        schema_version: report.to_version,
    })
}

/// Reports schema version and row counts. Opens the file read-only; a
/// missing file is reported rather than created.
pub fn status(path: &Path) -> StoreResult<StatusReport> {
    let schema = SchemaManager::new(path);
    if !path.exists() {
        return Ok(StatusReport {
            path: path.to_path_buf(),
            exists: false,
            schema_version: 0,
            latest_version: LATEST_VERSION,
            pending: crate::MIGRATIONS
                .iter()
                .map(|migration| PendingMigration {
                    version: migration.version,
                    name: migration.name.to_string(),
                })
                .collect(),
            applied: Vec::new(),
            row_counts: BTreeMap::new(),
        });
    }

    let connections = ConnectionManager::open(&StoreConfig::new(path).read_only(true))?;
    let schema_version = schema.current_version(&connections)?;
    let pending = schema.pending_migrations(&connections)?;
    let applied = schema.applied_migrations(&connections)?;
    let row_counts = connections.with_connection(|conn| {
        let mut counts = BTreeMap::new();
        for table in MANAGED_TABLES {
            if !table_exists(conn, table)? {
                continue;
            }
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            counts.insert(table.to_string(), count);
        }
        Ok(counts)
    })?;
    connections.close()?;

    Ok(StatusReport {
        path: path.to_path_buf(),
        exists: true,
        schema_version,
        latest_version: LATEST_VERSION,
        pending,
        applied,
        row_counts,
    })
}

fn open_existing(path: &Path) -> StoreResult<ConnectionManager> {
    if !path.exists() {
        return Err(StoreError::NotFound(format!("database {}", path.display())));
    }
    ConnectionManager::open(&StoreConfig::new(path))
}
