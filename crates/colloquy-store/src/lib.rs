use chrono::{DateTime, Utc};
use colloquy_types::RunStatus;

mod admin;
mod batch;
mod config;
mod connection;
mod import;
mod replay;
mod rows;
mod runtime;
mod schema;
mod store;

pub use admin::{create_fresh, migrate, reset, status, CreateReport, ResetReport, StatusReport};
pub use batch::{BatchWriter, FlushReport, FlushStats, PendingRow, Table};
pub use config::{RetryPolicy, StoreConfig};
pub use connection::{classify, ConnectionManager, Failure, QueryRow};
pub use import::{
    BatchImportReport, ImportResult, ImportService, Manifest, ManifestConversation,
    IMPORTED_MARKER, IMPORTING_MARKER, MANIFEST_FILE,
};
pub use replay::{parse_event_line, read_event_log, ParsedLog, ReplayEngine, ReplayError, ReplayOutcome};
pub use rows::EventRow;
pub use runtime::AsyncEventStore;
pub use schema::{Migration, MigrationReport, PendingMigration, SchemaManager, LATEST_VERSION, MIGRATIONS};
pub use store::{EventStore, ExperimentSummary};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer holds the database lock. Retried by the connection
    /// manager; only surfaces from a single attempt.
    #[error("database is locked: {0}")]
    TransientLock(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("import error: {0}")]
    Import(String),
    #[error("replay error: {0}")]
    Replay(String),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store is closed")]
    Closed,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub conversation_id: Option<String>,
    pub experiment_id: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Self::default()
        }
    }

    pub fn experiment(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: Some(experiment_id.into()),
            ..Self::default()
        }
    }
}

/// Requested change to a conversation's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub reason: Option<String>,
    pub final_convergence_score: Option<f64>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            reason: None,
            final_convergence_score: None,
            error: None,
        }
    }

    /// Terminal update derived from a domain end reason.
    pub fn ended(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: RunStatus::from_end_reason(&reason),
            reason: Some(reason),
            final_convergence_score: None,
            error: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.final_convergence_score = Some(score);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
