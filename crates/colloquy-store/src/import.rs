use chrono::{DateTime, Utc};
use colloquy_types::{
    Conversation, ConversationState, Experiment, Message, RunStatus, TurnMetrics, AGENT_A, AGENT_B,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::rows::{
    event_exists, insert_event_if_absent, to_millis, upsert_conversation, upsert_experiment,
    upsert_message, upsert_turn_metrics, EventRow,
};
use crate::store::stored_cursor;
use crate::{read_event_log, EventStore, ReplayEngine, StoreError, StoreResult};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const IMPORTED_MARKER: &str = ".imported";
pub const IMPORTING_MARKER: &str = ".importing";

/// Describes one exported experiment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub experiment_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_conversations: Option<u32>,
    #[serde(default)]
    pub completed_conversations: Option<u32>,
    #[serde(default)]
    pub failed_conversations: Option<u32>,
    #[serde(default)]
    pub conversations: BTreeMap<String, ManifestConversation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConversation {
    #[serde(alias = "log_file", alias = "path")]
    pub events_file: PathBuf,
}

impl Manifest {
    pub fn load(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| StoreError::Import(format!("cannot read {}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| StoreError::Import(format!("invalid manifest {}: {err}", path.display())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub source: String,
    pub success: bool,
    #[serde(default)]
    pub experiment_id: Option<String>,
    pub events_imported: usize,
    pub conversations_imported: usize,
    #[serde(default)]
    pub skipped_lines: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl ImportResult {
    fn empty(source: &str) -> Self {
        Self {
            source: source.to_string(),
            success: true,
            experiment_id: None,
            events_imported: 0,
            conversations_imported: 0,
            skipped_lines: 0,
            error: None,
        }
    }

    fn failed(source: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::empty(source)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchImportReport {
    pub results: Vec<ImportResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub events_imported: usize,
}

struct ReplayedConversation {
    conversation_id: String,
    rows: Vec<EventRow>,
    state: ConversationState,
    first_seen: Option<DateTime<Utc>>,
}

/// Replays exported event logs and persists them with their derived rows.
pub struct ImportService<'a> {
    store: &'a EventStore,
}

impl<'a> ImportService<'a> {
    pub fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    /// Imports one experiment directory. Failures are reported in the result;
    /// the `.importing` marker is always removed unless another run owns it.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn import(&self, dir: &Path) -> ImportResult {
        let source = dir.display().to_string();
        if dir.join(IMPORTED_MARKER).exists() {
            info!("directory already imported");
            return ImportResult::empty(&source);
        }

        let importing = dir.join(IMPORTING_MARKER);
        match OpenOptions::new().write(true).create_new(true).open(&importing) {
            Ok(mut marker) => {
                if let Err(err) = writeln!(marker, "{}", Utc::now().to_rfc3339()) {
                    warn!(error = %err, "could not write importing marker");
                }
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return ImportResult::failed(
                    &source,
                    "import already in progress or interrupted (.importing marker present)",
                );
            }
            Err(err) => return ImportResult::failed(&source, err),
        }

        // `.imported` goes down before `.importing` is lifted so the directory
        // is never left without a marker.
        let outcome = self.run(dir, &source);
        let result = match outcome {
            Ok(result) => {
                if let Err(err) = write_summary(&dir.join(IMPORTED_MARKER), &result) {
                    warn!(error = %err, "could not write imported marker");
                }
                info!(
                    events = result.events_imported,
                    conversations = result.conversations_imported,
                    "import finished"
                );
                result
            }
            Err(err) => {
                warn!(error = %err, "import failed");
                ImportResult::failed(&source, err)
            }
        };
        if let Err(err) = std::fs::remove_file(&importing) {
            warn!(error = %err, "could not remove importing marker");
        }
        result
    }

    /// Imports every subdirectory of `root` that holds a manifest, in name
    /// order. One failing directory does not stop the rest.
    pub fn import_all(&self, root: &Path) -> StoreResult<BatchImportReport> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut report = BatchImportReport::default();
        for dir in dirs {
            let result = self.import(&dir);
            if result.success {
                report.succeeded += 1;
                report.events_imported += result.events_imported;
            } else {
                report.failed += 1;
            }
            report.results.push(result);
        }
        info!(
            root = %root.display(),
            succeeded = report.succeeded,
            failed = report.failed,
            "batch import finished"
        );
        Ok(report)
    }

    fn run(&self, dir: &Path, source: &str) -> StoreResult<ImportResult> {
        let manifest = Manifest::load(dir)?;
        let mut replayed = Vec::new();
        let mut skipped_lines = 0;
        for (conversation_id, entry) in &manifest.conversations {
            let path = if entry.events_file.is_absolute() {
                entry.events_file.clone()
            } else {
                dir.join(&entry.events_file)
            };
            let parsed = read_event_log(&path, &format!("{source}/{conversation_id}"))
                .map_err(|err| StoreError::Import(format!("conversation {conversation_id}: {err}")))?;
            skipped_lines += parsed.skipped.len();
            let state = ReplayEngine::replay(&parsed.events);
            let mut rows = Vec::with_capacity(parsed.events.len());
            for event in &parsed.events {
                let mut row = EventRow::encode(event)?;
                row.conversation_id = Some(conversation_id.clone());
                row.experiment_id.get_or_insert_with(|| manifest.experiment_id.clone());
                rows.push(row);
            }
            replayed.push(ReplayedConversation {
                conversation_id: conversation_id.clone(),
                first_seen: parsed.events.iter().map(|event| event.timestamp).min(),
                rows,
                state,
            });
        }

        let now = Utc::now();
        let experiment = experiment_from_manifest(&manifest, &replayed, now);
        let events_imported = self.store.connections().transaction(|tx| {
            upsert_experiment(tx, &experiment)?;
            let mut inserted = 0;
            for conversation in &replayed {
                let record = conversation_from_state(conversation, &experiment.id, now);
                upsert_conversation(tx, &record)?;
                inserted += self.insert_new_events(tx, conversation)?;
                for message in &conversation.state.messages {
                    upsert_message(
                        tx,
                        &Message {
                            conversation_id: conversation.conversation_id.clone(),
                            turn_number: message.turn_number,
                            agent_id: message.agent_id.clone(),
                            content: message.content.clone(),
                            token_count: message.token_count,
                            model: message.model.clone(),
                            created_at: now,
                        },
                    )?;
                }
                for (turn_number, metrics) in derive_turn_metrics(&conversation.state) {
                    upsert_turn_metrics(tx, &conversation.conversation_id, turn_number, &metrics, now)?;
                }
            }
            tx.execute(
                "INSERT OR REPLACE INTO import_log
                     (source, experiment_id, imported_at, events_imported, conversations_imported)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    source,
                    experiment.id,
                    to_millis(now),
                    inserted as i64,
                    replayed.len() as i64
                ],
            )?;
            Ok(inserted)
        })?;

        Ok(ImportResult {
            source: source.to_string(),
            success: true,
            experiment_id: Some(experiment.id),
            events_imported,
            conversations_imported: replayed.len(),
            skipped_lines,
            error: None,
        })
    }

    /// Inserts the events the table does not hold yet. They are renumbered
    /// after the conversation's highest sequence, buffered appends included,
    /// so sequences keep increasing when a log lands next to live events.
    fn insert_new_events(
        &self,
        tx: &Connection,
        conversation: &ReplayedConversation,
    ) -> StoreResult<usize> {
        let mut fresh = Vec::new();
        for row in &conversation.rows {
            if !event_exists(tx, &row.event_id)? {
                fresh.push(row.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }
        fresh.sort_by_key(|row| (row.timestamp, row.sequence));

        let conversation_id = conversation.conversation_id.as_str();
        let stored = stored_cursor(tx, Some(conversation_id))?;
        let last_millis = fresh.iter().map(|row| row.timestamp).max().unwrap_or_default();
        let first = self
            .store
            .reserve_sequences(conversation_id, fresh.len(), stored, last_millis)?;
        let mut inserted = 0;
        for (offset, mut row) in fresh.into_iter().enumerate() {
            row.sequence = first + offset as i64;
            inserted += insert_event_if_absent(tx, &row)?;
        }
        Ok(inserted)
    }
}

fn experiment_from_manifest(
    manifest: &Manifest,
    replayed: &[ReplayedConversation],
    now: DateTime<Utc>,
) -> Experiment {
    let count = |status: RunStatus| {
        replayed
            .iter()
            .filter(|conversation| conversation.state.status == status)
            .count() as u32
    };
    let all_terminal = !replayed.is_empty()
        && replayed
            .iter()
            .all(|conversation| conversation.state.status.is_terminal());
    let derived_status = if all_terminal {
        RunStatus::Completed
    } else if replayed.is_empty() {
        RunStatus::Created
    } else {
        RunStatus::Running
    };
    let started_at = replayed
        .iter()
        .filter_map(|conversation| conversation.state.started_at)
        .min();
    Experiment {
        id: manifest.experiment_id.clone(),
        name: manifest
            .name
            .clone()
            .unwrap_or_else(|| manifest.experiment_id.clone()),
        config: manifest.config.clone(),
        status: manifest.status.unwrap_or(derived_status),
        created_at: manifest.created_at.or(started_at).unwrap_or(now),
        started_at,
        completed_at: manifest.completed_at,
        total_conversations: manifest
            .total_conversations
            .unwrap_or(replayed.len() as u32),
        completed_conversations: manifest
            .completed_conversations
            .unwrap_or_else(|| count(RunStatus::Completed)),
        failed_conversations: manifest
            .failed_conversations
            .unwrap_or_else(|| count(RunStatus::Failed)),
        error_message: None,
    }
}

fn conversation_from_state(
    conversation: &ReplayedConversation,
    experiment_id: &str,
    now: DateTime<Utc>,
) -> Conversation {
    let state = &conversation.state;
    Conversation {
        id: conversation.conversation_id.clone(),
        experiment_id: experiment_id.to_string(),
        status: state.status,
        end_reason: state.end_reason.clone(),
        config: state.config(),
        total_turns: state.total_turns,
        final_convergence_score: state.final_convergence_score,
        created_at: conversation.first_seen.unwrap_or(now),
        started_at: state.started_at,
        completed_at: state.completed_at,
        error_message: None,
    }
}

/// Rebuilds the store-side turn metrics a replay can vouch for: the turn's
/// convergence score plus message sizes and token counts.
fn derive_turn_metrics(state: &ConversationState) -> Vec<(u32, TurnMetrics)> {
    let agent_a = state
        .agent_a
        .as_ref()
        .map_or(AGENT_A, |agent| agent.agent_id.as_str());
    let agent_b = state
        .agent_b
        .as_ref()
        .map_or(AGENT_B, |agent| agent.agent_id.as_str());
    let turns: BTreeSet<u32> = state
        .messages
        .iter()
        .map(|message| message.turn_number)
        .chain(state.turn_scores.keys().copied())
        .collect();

    turns
        .into_iter()
        .map(|turn_number| {
            let mut metrics = TurnMetrics {
                convergence_score: state.turn_scores.get(&turn_number).copied(),
                ..TurnMetrics::default()
            };
            for message in state.messages_for_turn(turn_number) {
                let length = Some(message.content.chars().count() as i64);
                let words = Some(message.content.split_whitespace().count() as i64);
                if message.agent_id == agent_a {
                    metrics.message_a_length = length;
                    metrics.message_a_word_count = words;
                    metrics.message_a_tokens = message.token_count;
                } else if message.agent_id == agent_b {
                    metrics.message_b_length = length;
                    metrics.message_b_word_count = words;
                    metrics.message_b_tokens = message.token_count;
                }
            }
            (turn_number, metrics)
        })
        .collect()
}

fn write_summary(path: &Path, result: &ImportResult) -> StoreResult<()> {
    let body = serde_json::to_string_pretty(result)?;
    std::fs::write(path, body)?;
    Ok(())
}
