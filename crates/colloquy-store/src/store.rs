use chrono::Utc;
use colloquy_types::{
    Conversation, ConversationConfig, ConversationCreated, ConversationStatusChanged, Event,
    EventKind, Experiment, ExperimentCreated, ExperimentStatusChanged, Message, RunStatus,
    TurnMetrics, TurnMetricsRecord,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::rows::{
    find_conversation, find_experiment, from_millis, read_conversation, read_event,
    read_message, read_turn_metrics, to_millis, to_u32, upsert_conversation, upsert_experiment,
    upsert_turn_metrics, EventRow, CONVERSATION_COLUMNS, EVENT_COLUMNS, MESSAGE_COLUMNS,
    TURN_METRICS_COLUMNS,
};
use crate::{
    BatchWriter, ConnectionManager, EventFilter, FlushReport, FlushStats, PendingRow,
    SchemaManager, StatusUpdate, StoreConfig, StoreError, StoreResult,
};

/// Aggregated outcome of one experiment's conversations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub conversations: u32,
    pub completed: u32,
    pub failed: u32,
    pub interrupted: u32,
    pub avg_turns: Option<f64>,
    pub avg_final_convergence: Option<f64>,
    pub avg_turn_convergence: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SequenceCursor {
    pub(crate) last: i64,
    pub(crate) last_millis: i64,
}

impl SequenceCursor {
    fn merge(self, other: SequenceCursor) -> SequenceCursor {
        SequenceCursor {
            last: self.last.max(other.last),
            last_millis: self.last_millis.max(other.last_millis),
        }
    }
}

pub struct EventStore {
    config: StoreConfig,
    connections: Arc<ConnectionManager>,
    schema: SchemaManager,
    writer: BatchWriter,
    sequences: Mutex<HashMap<Option<String>, SequenceCursor>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.config.path)
            .field("read_only", &self.config.read_only)
            .finish()
    }
}

impl EventStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        Self::open(StoreConfig::new(path))
    }

    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let connections = Arc::new(ConnectionManager::open(&config)?);
        let schema = SchemaManager::new(connections.path());
        if !config.read_only {
            schema.migrate(&connections)?;
        }
        let writer = BatchWriter::new(Arc::clone(&connections), &config)?;
        info!(path = %config.path.display(), read_only = config.read_only, "opened event store");
        Ok(Self {
            config,
            connections,
            schema,
            writer,
            sequences: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn schema(&self) -> &SchemaManager {
        &self.schema
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(StoreError::InvalidInput("store is read-only".to_string()));
        }
        Ok(())
    }

    /// Assigns the next sequence number for `conversation_id` and buffers the
    /// event. The row reaches the database on the next flush.
    pub fn append_event(
        &self,
        kind: EventKind,
        conversation_id: Option<&str>,
        experiment_id: Option<&str>,
    ) -> StoreResult<i64> {
        self.ensure_writable()?;
        let key = conversation_id.map(str::to_string);
        let seeded = self
            .sequences
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .contains_key(&key);
        let persisted = if seeded {
            None
        } else {
            Some(self.persisted_cursor(conversation_id)?)
        };
        let mut sequences = self.sequences.lock().map_err(|_| StoreError::Poisoned)?;
        let cursor = match (sequences.get(&key), persisted) {
            (Some(cached), Some(persisted)) => cached.merge(persisted),
            (Some(cached), None) => *cached,
            (None, persisted) => persisted.unwrap_or_default(),
        };
        let next = SequenceCursor {
            last: cursor.last + 1,
            last_millis: to_millis(Utc::now()).max(cursor.last_millis),
        };
        let event = Event {
            event_id: Uuid::new_v4().to_string(),
            timestamp: from_millis(next.last_millis),
            conversation_id: key.clone(),
            experiment_id: experiment_id.map(str::to_string),
            sequence: next.last,
            kind,
        };
        self.writer.enqueue(PendingRow::Event(EventRow::encode(&event)?))?;
        sequences.insert(key, next);
        debug!(
            event_type = event.event_type(),
            conversation_id = ?event.conversation_id,
            sequence = next.last,
            "appended event"
        );
        Ok(next.last)
    }

    fn persisted_cursor(&self, conversation_id: Option<&str>) -> StoreResult<SequenceCursor> {
        self.connections
            .with_connection(|conn| Ok(stored_cursor(conn, conversation_id)?))
    }

    /// Claims `count` consecutive sequence numbers for rows written outside
    /// `append_event` and returns the first one. `stored` is the table's view
    /// of the conversation; buffered appends are covered by the cached cursor.
    pub(crate) fn reserve_sequences(
        &self,
        conversation_id: &str,
        count: usize,
        stored: SequenceCursor,
        last_millis: i64,
    ) -> StoreResult<i64> {
        let mut sequences = self.sequences.lock().map_err(|_| StoreError::Poisoned)?;
        let key = Some(conversation_id.to_string());
        let cursor = sequences
            .get(&key)
            .map_or(stored, |cached| cached.merge(stored));
        let first = cursor.last + 1;
        sequences.insert(
            key,
            SequenceCursor {
                last: cursor.last + count as i64,
                last_millis: cursor.last_millis.max(last_millis),
            },
        );
        Ok(first)
    }

    #[instrument(skip(self, config))]
    pub fn create_experiment(&self, name: &str, config: Value) -> StoreResult<String> {
        self.ensure_writable()?;
        if name.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "experiment name must not be empty".to_string(),
            ));
        }
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            config,
            status: RunStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_conversations: 0,
            completed_conversations: 0,
            failed_conversations: 0,
            error_message: None,
        };
        self.connections
            .with_connection(|conn| upsert_experiment(conn, &experiment))?;
        self.append_event(
            EventKind::ExperimentCreated(ExperimentCreated {
                name: experiment.name.clone(),
                config: experiment.config.clone(),
            }),
            None,
            Some(&experiment.id),
        )?;
        info!(experiment_id = %experiment.id, "created experiment");
        Ok(experiment.id)
    }

    #[instrument(skip(self, config))]
    pub fn create_conversation(
        &self,
        experiment_id: &str,
        conversation_id: &str,
        config: ConversationConfig,
    ) -> StoreResult<Conversation> {
        self.ensure_writable()?;
        if conversation_id.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "conversation id must not be empty".to_string(),
            ));
        }
        let conversation = Conversation {
            id: conversation_id.to_string(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Created,
            end_reason: None,
            config,
            total_turns: 0,
            final_convergence_score: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        self.connections.transaction(|tx| {
            if find_experiment(tx, experiment_id)?.is_none() {
                return Err(StoreError::NotFound(format!("experiment {experiment_id}")));
            }
            if find_conversation(tx, conversation_id)?.is_some() {
                return Err(StoreError::InvalidInput(format!(
                    "conversation {conversation_id} already exists"
                )));
            }
            upsert_conversation(tx, &conversation)?;
            tx.execute(
                "UPDATE experiments SET total_conversations = total_conversations + 1
                 WHERE experiment_id = ?1",
                [experiment_id],
            )?;
            Ok(())
        })?;
        self.append_event(
            EventKind::ConversationCreated(ConversationCreated {
                experiment_id: experiment_id.to_string(),
                config: conversation.config.clone(),
            }),
            Some(conversation_id),
            Some(experiment_id),
        )?;
        Ok(conversation)
    }

    /// Moves a conversation through its lifecycle. `total_turns` is recounted
    /// from the persisted turn metrics; completed and failed endings bump the
    /// owning experiment's counters. Repeating the current status is a no-op.
    #[instrument(skip(self, update), fields(status = %update.status))]
    pub fn update_conversation_status(
        &self,
        conversation_id: &str,
        update: StatusUpdate,
    ) -> StoreResult<Conversation> {
        self.ensure_writable()?;
        let now = Utc::now();
        let (conversation, changed) = self.connections.transaction(|tx| {
            let mut conversation = find_conversation(tx, conversation_id)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
            let from = conversation.status;
            if from == update.status {
                return Ok((conversation, false));
            }
            if !from.can_transition_to(update.status) {
                return Err(StoreError::InvalidTransition {
                    from,
                    to: update.status,
                });
            }

            let turns: i64 = tx.query_row(
                "SELECT COUNT(*) FROM turn_metrics WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            conversation.status = update.status;
            conversation.total_turns = to_u32(turns);
            if update.reason.is_some() {
                conversation.end_reason = update.reason.clone();
            }
            if update.final_convergence_score.is_some() {
                conversation.final_convergence_score = update.final_convergence_score;
            }
            if update.error.is_some() {
                conversation.error_message = update.error.clone();
            }
            if update.status == RunStatus::Running {
                conversation.started_at.get_or_insert(now);
            }
            if update.status.is_terminal() {
                conversation.completed_at = Some(now);
            }
            upsert_conversation(tx, &conversation)?;

            let counter = match update.status {
                RunStatus::Completed => Some("completed_conversations"),
                RunStatus::Failed => Some("failed_conversations"),
                _ => None,
            };
            if let Some(column) = counter {
                tx.execute(
                    &format!(
                        "UPDATE experiments SET {column} = {column} + 1 WHERE experiment_id = ?1"
                    ),
                    [&conversation.experiment_id],
                )?;
            }
            Ok((conversation, true))
        })?;

        if changed {
            self.append_event(
                EventKind::ConversationStatusChanged(ConversationStatusChanged {
                    status: conversation.status,
                    reason: update.reason,
                    final_convergence_score: update.final_convergence_score,
                    error: update.error,
                }),
                Some(conversation_id),
                Some(&conversation.experiment_id),
            )?;
            info!(
                conversation_id,
                status = %conversation.status,
                total_turns = conversation.total_turns,
                "conversation status changed"
            );
        }
        Ok(conversation)
    }

    #[instrument(skip(self, error))]
    pub fn update_experiment_status(
        &self,
        experiment_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> StoreResult<Experiment> {
        self.ensure_writable()?;
        let now = Utc::now();
        let (experiment, changed) = self.connections.transaction(|tx| {
            let mut experiment = find_experiment(tx, experiment_id)?
                .ok_or_else(|| StoreError::NotFound(format!("experiment {experiment_id}")))?;
            let from = experiment.status;
            if from == status {
                return Ok((experiment, false));
            }
            if !from.can_transition_to(status) {
                return Err(StoreError::InvalidTransition { from, to: status });
            }
            experiment.status = status;
            if status == RunStatus::Running {
                experiment.started_at.get_or_insert(now);
            }
            if status.is_terminal() {
                experiment.completed_at = Some(now);
            }
            if error.is_some() {
                experiment.error_message = error.clone();
            }
            upsert_experiment(tx, &experiment)?;
            Ok((experiment, true))
        })?;

        if changed {
            self.append_event(
                EventKind::ExperimentStatusChanged(ExperimentStatusChanged { status, error }),
                None,
                Some(experiment_id),
            )?;
        }
        Ok(experiment)
    }

    pub fn log_turn_metrics(
        &self,
        conversation_id: &str,
        turn_number: u32,
        metrics: &TurnMetrics,
    ) -> StoreResult<()> {
        self.ensure_writable()?;
        let created_at = Utc::now();
        self.connections.transaction(|tx| {
            if find_conversation(tx, conversation_id)?.is_none() {
                return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
            }
            upsert_turn_metrics(tx, conversation_id, turn_number, metrics, created_at)?;
            Ok(())
        })?;
        debug!(conversation_id, turn_number, "logged turn metrics");
        Ok(())
    }

    /// Buffers one agent message. Blank content is ignored and reported as
    /// `false`.
    pub fn log_message(
        &self,
        conversation_id: &str,
        turn_number: u32,
        agent_id: &str,
        content: &str,
        token_count: Option<i64>,
        model: Option<&str>,
    ) -> StoreResult<bool> {
        self.ensure_writable()?;
        if content.trim().is_empty() {
            debug!(conversation_id, turn_number, agent_id, "skipping empty message");
            return Ok(false);
        }
        self.writer.enqueue(PendingRow::Message(Message {
            conversation_id: conversation_id.to_string(),
            turn_number,
            agent_id: agent_id.to_string(),
            content: content.to_string(),
            token_count,
            model: model.map(str::to_string),
            created_at: Utc::now(),
        }))?;
        Ok(true)
    }

    /// Persisted events matching `filter`, ordered by `(timestamp, sequence)`.
    /// Buffered rows are not visible until flushed.
    pub fn get_events(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        self.ensure_open()?;
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1");
        let mut params = Vec::new();
        if let Some(conversation_id) = &filter.conversation_id {
            sql.push_str(" AND conversation_id = ?");
            params.push(SqlValue::Text(conversation_id.clone()));
        }
        if let Some(experiment_id) = &filter.experiment_id {
            sql.push_str(" AND experiment_id = ?");
            params.push(SqlValue::Text(experiment_id.clone()));
        }
        if let Some(event_type) = &filter.event_type {
            sql.push_str(" AND event_type = ?");
            params.push(SqlValue::Text(event_type.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND timestamp >= ?");
            params.push(SqlValue::Integer(to_millis(since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND timestamp <= ?");
            params.push(SqlValue::Integer(to_millis(until)));
        }
        sql.push_str(" ORDER BY timestamp ASC, sequence ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        self.connections.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), read_event)?;
            let mut events = Vec::new();
            for event in rows {
                events.push(event?);
            }
            Ok(events)
        })
    }

    pub fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<Experiment>> {
        self.ensure_open()?;
        self.connections
            .with_connection(|conn| Ok(find_experiment(conn, experiment_id)?))
    }

    pub fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        self.ensure_open()?;
        self.connections
            .with_connection(|conn| Ok(find_conversation(conn, conversation_id)?))
    }

    pub fn list_conversations(&self, experiment_id: &str) -> StoreResult<Vec<Conversation>> {
        self.ensure_open()?;
        self.connections.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE experiment_id = ?1 ORDER BY created_at ASC, conversation_id ASC"
            ))?;
            let rows = stmt.query_map([experiment_id], read_conversation)?;
            let mut conversations = Vec::new();
            for conversation in rows {
                conversations.push(conversation?);
            }
            Ok(conversations)
        })
    }

    pub fn get_turn_metrics(&self, conversation_id: &str) -> StoreResult<Vec<TurnMetricsRecord>> {
        self.ensure_open()?;
        self.connections.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_METRICS_COLUMNS} FROM turn_metrics
                 WHERE conversation_id = ?1 ORDER BY turn_number ASC"
            ))?;
            let rows = stmt.query_map([conversation_id], read_turn_metrics)?;
            let mut records = Vec::new();
            for record in rows {
                records.push(record?);
            }
            Ok(records)
        })
    }

    pub fn get_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        self.ensure_open()?;
        self.connections.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 ORDER BY turn_number ASC, agent_id ASC"
            ))?;
            let rows = stmt.query_map([conversation_id], read_message)?;
            let mut messages = Vec::new();
            for message in rows {
                messages.push(message?);
            }
            Ok(messages)
        })
    }

    pub fn experiment_summary(&self, experiment_id: &str) -> StoreResult<ExperimentSummary> {
        self.ensure_open()?;
        self.connections.with_connection(|conn| {
            if find_experiment(conn, experiment_id)?.is_none() {
                return Err(StoreError::NotFound(format!("experiment {experiment_id}")));
            }
            let summary = conn
                .query_row(
                    "SELECT conversations, completed, failed, interrupted, avg_turns,
                            avg_final_convergence, avg_turn_convergence
                     FROM experiment_summary WHERE experiment_id = ?1",
                    [experiment_id],
                    |row| {
                        Ok(ExperimentSummary {
                            experiment_id: experiment_id.to_string(),
                            conversations: to_u32(row.get(0)?),
                            completed: to_u32(row.get(1)?),
                            failed: to_u32(row.get(2)?),
                            interrupted: to_u32(row.get(3)?),
                            avg_turns: row.get(4)?,
                            avg_final_convergence: row.get(5)?,
                            avg_turn_convergence: row.get(6)?,
                        })
                    },
                )
                .optional()?;
            Ok(summary.unwrap_or_else(|| ExperimentSummary {
                experiment_id: experiment_id.to_string(),
                conversations: 0,
                completed: 0,
                failed: 0,
                interrupted: 0,
                avg_turns: None,
                avg_final_convergence: None,
                avg_turn_convergence: None,
            }))
        })
    }

    pub fn flush(&self) -> StoreResult<FlushReport> {
        self.ensure_open()?;
        self.writer.flush()
    }

    pub fn stats(&self) -> FlushStats {
        self.writer.stats()
    }

    /// Stops the batch writer after a final flush, then closes the pool.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.stop()?;
        self.connections.close()?;
        let stats = self.writer.stats();
        info!(
            flushed_rows = stats.flushed_rows,
            dropped_rows = stats.dropped_rows,
            "closed event store"
        );
        Ok(())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close event store");
        }
    }
}

pub(crate) fn stored_cursor(
    conn: &rusqlite::Connection,
    conversation_id: Option<&str>,
) -> rusqlite::Result<SequenceCursor> {
    conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0), COALESCE(MAX(timestamp), 0)
         FROM events WHERE conversation_id IS ?1",
        [conversation_id],
        |row| {
            Ok(SequenceCursor {
                last: row.get(0)?,
                last_millis: row.get(1)?,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::{tags, AgentConfig, MessageComplete};
    use serde_json::json;

    fn open_store(dir: &tempfile::TempDir) -> EventStore {
        EventStore::new(dir.path().join("colloquy.db")).unwrap()
    }

    fn conversation_config() -> ConversationConfig {
        ConversationConfig {
            agent_a: Some(AgentConfig {
                agent_id: "agent_a".to_string(),
                model: "model-a".to_string(),
                temperature: Some(0.7),
            }),
            agent_b: Some(AgentConfig {
                agent_id: "agent_b".to_string(),
                model: "model-b".to_string(),
                temperature: Some(0.9),
            }),
            initial_prompt: Some("Discuss tides.".to_string()),
            max_turns: Some(5),
            ..ConversationConfig::default()
        }
    }

    fn tokens(agent: &str) -> EventKind {
        EventKind::MessageComplete(MessageComplete {
            agent_id: agent.to_string(),
            turn_number: None,
            tokens: 3,
        })
    }

    #[test]
    fn completed_conversation_counts_logged_turns() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let experiment_id = store
            .create_experiment("T", json!({"repetitions": 3}))
            .unwrap();
        store
            .create_conversation(&experiment_id, "c1", conversation_config())
            .unwrap();
        for turn in 1..=5 {
            let metrics = TurnMetrics {
                convergence_score: Some(0.1 * f64::from(turn)),
                vocabulary_a: vec!["tide".to_string()],
                ..TurnMetrics::default()
            };
            store.log_turn_metrics("c1", turn, &metrics).unwrap();
        }

        store
            .update_conversation_status("c1", StatusUpdate::new(RunStatus::Completed))
            .unwrap();
        let conversation = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conversation.total_turns, 5);
        assert_eq!(conversation.status, RunStatus::Completed);
        assert!(conversation.completed_at.is_some());

        let experiment = store.get_experiment(&experiment_id).unwrap().unwrap();
        assert_eq!(experiment.total_conversations, 1);
        assert_eq!(experiment.completed_conversations, 1);
        assert_eq!(experiment.config, json!({"repetitions": 3}));

        let metrics = store.get_turn_metrics("c1").unwrap();
        assert_eq!(metrics.len(), 5);
        assert_eq!(metrics[0].metrics.vocabulary_a, vec!["tide".to_string()]);
    }

    #[test]
    fn sequences_are_gap_free_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut assigned = Vec::new();
        for idx in 0..10 {
            assigned.push(store.append_event(tokens("agent_a"), Some("c1"), None).unwrap());
            if idx % 3 == 0 {
                store.append_event(tokens("agent_b"), Some("c2"), None).unwrap();
            }
        }
        assert_eq!(assigned, (1..=10).collect::<Vec<i64>>());

        store.flush().unwrap();
        let events = store.get_events(&EventFilter::conversation("c1")).unwrap();
        let sequences: Vec<i64> = events.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, assigned);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
        assert_eq!(events[0].event_type(), tags::MESSAGE_COMPLETE);
        assert_eq!(store.get_events(&EventFilter::conversation("c2")).unwrap().len(), 4);
    }

    #[test]
    fn sequences_resume_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            for _ in 0..3 {
                store.append_event(tokens("agent_a"), Some("c1"), None).unwrap();
            }
            store.close().unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.append_event(tokens("agent_a"), Some("c1"), None).unwrap(), 4);
        assert_eq!(store.append_event(tokens("agent_a"), Some("c9"), None).unwrap(), 1);
    }

    #[test]
    fn concurrent_first_appends_seed_from_the_table_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            for _ in 0..3 {
                store.append_event(tokens("agent_a"), Some("c1"), None).unwrap();
            }
            store.close().unwrap();
        }
        let store = open_store(&dir);
        let mut assigned: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..5)
                            .map(|_| store.append_event(tokens("agent_b"), Some("c1"), None).unwrap())
                            .collect::<Vec<i64>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });
        assigned.sort_unstable();
        assert_eq!(assigned, (4..=23).collect::<Vec<i64>>());
    }

    #[test]
    fn completed_conversation_cannot_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let experiment_id = store.create_experiment("T", json!({})).unwrap();
        store
            .create_conversation(&experiment_id, "c1", conversation_config())
            .unwrap();
        store
            .update_conversation_status("c1", StatusUpdate::new(RunStatus::Running))
            .unwrap();
        store
            .update_conversation_status("c1", StatusUpdate::ended("max_turns").with_score(0.8))
            .unwrap();

        let err = store
            .update_conversation_status("c1", StatusUpdate::new(RunStatus::Running))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: RunStatus::Completed,
                to: RunStatus::Running
            }
        ));
        let conversation = store.get_conversation("c1").unwrap().unwrap();
        assert_eq!(conversation.status, RunStatus::Completed);
        assert_eq!(conversation.end_reason.as_deref(), Some("max_turns"));
        assert_eq!(conversation.final_convergence_score, Some(0.8));
    }

    #[test]
    fn counters_follow_terminal_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let experiment_id = store.create_experiment("T", json!({})).unwrap();
        for (id, reason) in [("c1", "high_convergence"), ("c2", "error"), ("c3", "user_abort")] {
            store
                .create_conversation(&experiment_id, id, conversation_config())
                .unwrap();
            store
                .update_conversation_status(id, StatusUpdate::ended(reason))
                .unwrap();
        }
        let experiment = store.get_experiment(&experiment_id).unwrap().unwrap();
        assert_eq!(experiment.total_conversations, 3);
        assert_eq!(experiment.completed_conversations, 1);
        assert_eq!(experiment.failed_conversations, 1);

        let summary = store.experiment_summary(&experiment_id).unwrap();
        assert_eq!(summary.conversations, 3);
        assert_eq!(summary.interrupted, 1);
        assert_eq!(
            store.get_conversation("c3").unwrap().unwrap().status,
            RunStatus::Interrupted
        );

        store.flush().unwrap();
        let changes = store
            .get_events(&EventFilter {
                experiment_id: Some(experiment_id.clone()),
                event_type: Some(tags::CONVERSATION_STATUS_CHANGED.to_string()),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn referential_checks_reject_unknown_owners() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.create_conversation("nope", "c1", ConversationConfig::default()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.log_turn_metrics("c1", 1, &TurnMetrics::default()),
            Err(StoreError::NotFound(_))
        ));
        let experiment_id = store.create_experiment("T", json!({})).unwrap();
        store
            .create_conversation(&experiment_id, "c1", ConversationConfig::default())
            .unwrap();
        assert!(matches!(
            store.create_conversation(&experiment_id, "c1", ConversationConfig::default()),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn messages_skip_blank_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store
            .log_message("c1", 1, "agent_a", "Tides follow the moon.", Some(6), Some("model-a"))
            .unwrap());
        assert!(!store.log_message("c1", 1, "agent_b", "   ", None, None).unwrap());
        store.flush().unwrap();
        let messages = store.get_messages("c1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].token_count, Some(6));
    }

    #[test]
    fn close_flushes_and_rejects_further_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colloquy.db");
        let store = EventStore::new(&path).unwrap();
        store.append_event(tokens("agent_a"), Some("c1"), None).unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.append_event(tokens("agent_a"), Some("c1"), None),
            Err(StoreError::Closed)
        ));

        let reader = EventStore::open(StoreConfig::new(&path).read_only(true)).unwrap();
        assert_eq!(reader.get_events(&EventFilter::conversation("c1")).unwrap().len(), 1);
        assert!(matches!(
            reader.create_experiment("T", json!({})),
            Err(StoreError::InvalidInput(_))
        ));
    }
}
