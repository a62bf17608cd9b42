use chrono::{DateTime, Utc};
use colloquy_types::{
    Conversation, ConversationConfig, Event, EventKind, Experiment, Message, RunStatus,
    TurnMetrics, TurnMetricsRecord,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::StoreResult;

pub(crate) const EVENT_COLUMNS: &str =
    "event_id, timestamp, event_type, conversation_id, experiment_id, payload, sequence";

pub(crate) const EXPERIMENT_COLUMNS: &str = "experiment_id, name, config, status, created_at, \
     started_at, completed_at, total_conversations, completed_conversations, \
     failed_conversations, error_message";

pub(crate) const CONVERSATION_COLUMNS: &str = "conversation_id, experiment_id, status, end_reason, \
     config, total_turns, final_convergence_score, created_at, started_at, completed_at, \
     error_message";

pub(crate) const TURN_METRICS_COLUMNS: &str = "conversation_id, turn_number, convergence_score, \
     vocabulary_overlap, structural_similarity, semantic_similarity, sentiment_similarity, \
     formality_similarity, pronoun_similarity, question_alignment, repetition_rate_a, \
     repetition_rate_b, length_ratio, message_a_length, message_b_length, message_a_word_count, \
     message_b_word_count, message_a_tokens, message_b_tokens, shared_vocabulary_size, \
     dominant_style, vocabulary_a, vocabulary_b, created_at";

pub(crate) const MESSAGE_COLUMNS: &str =
    "conversation_id, turn_number, agent_id, content, token_count, model, created_at";

/// An event already encoded for the `events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub event_id: String,
    pub timestamp: i64,
    pub event_type: String,
    pub conversation_id: Option<String>,
    pub experiment_id: Option<String>,
    pub payload: String,
    pub sequence: i64,
}

impl EventRow {
    pub fn encode(event: &Event) -> StoreResult<Self> {
        Ok(Self {
            event_id: event.event_id.clone(),
            timestamp: to_millis(event.timestamp),
            event_type: event.event_type().to_string(),
            conversation_id: event.conversation_id.clone(),
            experiment_id: event.experiment_id.clone(),
            payload: encode_json(&event.kind.payload()?)?,
            sequence: event.sequence,
        })
    }
}

pub(crate) fn insert_event(conn: &Connection, row: &EventRow) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, conversation_id, experiment_id, payload, sequence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.event_id,
            row.timestamp,
            row.event_type,
            row.conversation_id,
            row.experiment_id,
            row.payload,
            row.sequence,
        ],
    )
}

/// Same as [`insert_event`] but a duplicate `event_id` is a no-op.
pub(crate) fn insert_event_if_absent(conn: &Connection, row: &EventRow) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO events (event_id, timestamp, event_type, conversation_id, experiment_id, payload, sequence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.event_id,
            row.timestamp,
            row.event_type,
            row.conversation_id,
            row.experiment_id,
            row.payload,
            row.sequence,
        ],
    )
}

pub(crate) fn event_exists(conn: &Connection, event_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM events WHERE event_id = ?1)",
        [event_id],
        |row| row.get(0),
    )
}

pub(crate) fn read_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(2)?;
    let payload: String = row.get(5)?;
    let payload: serde_json::Value = decode_json_row(&payload)?;
    let kind = EventKind::from_parts(&event_type, payload)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err)))?;
    Ok(Event {
        event_id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        conversation_id: row.get(3)?,
        experiment_id: row.get(4)?,
        sequence: row.get(6)?,
        kind,
    })
}

pub(crate) fn upsert_message(conn: &Connection, message: &Message) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO messages (conversation_id, turn_number, agent_id, content, token_count, model, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (conversation_id, turn_number, agent_id)
         DO UPDATE SET content = excluded.content,
                       token_count = excluded.token_count,
                       model = excluded.model",
        params![
            message.conversation_id,
            i64::from(message.turn_number),
            message.agent_id,
            message.content,
            message.token_count,
            message.model,
            to_millis(message.created_at),
        ],
    )
}

pub(crate) fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        conversation_id: row.get(0)?,
        turn_number: to_u32(row.get(1)?),
        agent_id: row.get(2)?,
        content: row.get(3)?,
        token_count: row.get(4)?,
        model: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}

pub(crate) fn upsert_turn_metrics(
    conn: &Connection,
    conversation_id: &str,
    turn_number: u32,
    metrics: &TurnMetrics,
    created_at: DateTime<Utc>,
) -> StoreResult<usize> {
    let sql = format!(
        "INSERT INTO turn_metrics ({TURN_METRICS_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
         ON CONFLICT (conversation_id, turn_number)
         DO UPDATE SET convergence_score = excluded.convergence_score,
                       vocabulary_overlap = excluded.vocabulary_overlap,
                       structural_similarity = excluded.structural_similarity,
                       semantic_similarity = excluded.semantic_similarity,
                       sentiment_similarity = excluded.sentiment_similarity,
                       formality_similarity = excluded.formality_similarity,
                       pronoun_similarity = excluded.pronoun_similarity,
                       question_alignment = excluded.question_alignment,
                       repetition_rate_a = excluded.repetition_rate_a,
                       repetition_rate_b = excluded.repetition_rate_b,
                       length_ratio = excluded.length_ratio,
                       message_a_length = excluded.message_a_length,
                       message_b_length = excluded.message_b_length,
                       message_a_word_count = excluded.message_a_word_count,
                       message_b_word_count = excluded.message_b_word_count,
                       message_a_tokens = excluded.message_a_tokens,
                       message_b_tokens = excluded.message_b_tokens,
                       shared_vocabulary_size = excluded.shared_vocabulary_size,
                       dominant_style = excluded.dominant_style,
                       vocabulary_a = excluded.vocabulary_a,
                       vocabulary_b = excluded.vocabulary_b"
    );
    let values = vec![
        SqlValue::Text(conversation_id.to_string()),
        SqlValue::Integer(i64::from(turn_number)),
        option_f64_to_value(metrics.convergence_score),
        option_f64_to_value(metrics.vocabulary_overlap),
        option_f64_to_value(metrics.structural_similarity),
        option_f64_to_value(metrics.semantic_similarity),
        option_f64_to_value(metrics.sentiment_similarity),
        option_f64_to_value(metrics.formality_similarity),
        option_f64_to_value(metrics.pronoun_similarity),
        option_f64_to_value(metrics.question_alignment),
        option_f64_to_value(metrics.repetition_rate_a),
        option_f64_to_value(metrics.repetition_rate_b),
        option_f64_to_value(metrics.length_ratio),
        option_i64_to_value(metrics.message_a_length),
        option_i64_to_value(metrics.message_b_length),
        option_i64_to_value(metrics.message_a_word_count),
        option_i64_to_value(metrics.message_b_word_count),
        option_i64_to_value(metrics.message_a_tokens),
        option_i64_to_value(metrics.message_b_tokens),
        option_i64_to_value(metrics.shared_vocabulary_size),
        option_text_to_value(metrics.dominant_style.clone()),
        SqlValue::Text(encode_json(&metrics.vocabulary_a)?),
        SqlValue::Text(encode_json(&metrics.vocabulary_b)?),
        SqlValue::Integer(to_millis(created_at)),
    ];
    Ok(conn.execute(&sql, rusqlite::params_from_iter(values))?)
}

pub(crate) fn read_turn_metrics(row: &Row<'_>) -> rusqlite::Result<TurnMetricsRecord> {
    let vocabulary_a: String = row.get(21)?;
    let vocabulary_b: String = row.get(22)?;
    Ok(TurnMetricsRecord {
        conversation_id: row.get(0)?,
        turn_number: to_u32(row.get(1)?),
        metrics: TurnMetrics {
            convergence_score: row.get(2)?,
            vocabulary_overlap: row.get(3)?,
            structural_similarity: row.get(4)?,
            semantic_similarity: row.get(5)?,
            sentiment_similarity: row.get(6)?,
            formality_similarity: row.get(7)?,
            pronoun_similarity: row.get(8)?,
            question_alignment: row.get(9)?,
            repetition_rate_a: row.get(10)?,
            repetition_rate_b: row.get(11)?,
            length_ratio: row.get(12)?,
            message_a_length: row.get(13)?,
            message_b_length: row.get(14)?,
            message_a_word_count: row.get(15)?,
            message_b_word_count: row.get(16)?,
            message_a_tokens: row.get(17)?,
            message_b_tokens: row.get(18)?,
            shared_vocabulary_size: row.get(19)?,
            dominant_style: row.get(20)?,
            vocabulary_a: decode_json_row(&vocabulary_a)?,
            vocabulary_b: decode_json_row(&vocabulary_b)?,
        },
        created_at: from_millis(row.get(23)?),
    })
}

/// Inserts or fully replaces an experiment row.
pub(crate) fn upsert_experiment(conn: &Connection, experiment: &Experiment) -> StoreResult<usize> {
    Ok(conn.execute(
        "INSERT INTO experiments (experiment_id, name, config, status, created_at, started_at,
                                  completed_at, total_conversations, completed_conversations,
                                  failed_conversations, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (experiment_id)
         DO UPDATE SET name = excluded.name,
                       config = excluded.config,
                       status = excluded.status,
                       started_at = excluded.started_at,
                       completed_at = excluded.completed_at,
                       total_conversations = excluded.total_conversations,
                       completed_conversations = excluded.completed_conversations,
                       failed_conversations = excluded.failed_conversations,
                       error_message = excluded.error_message",
        params![
            experiment.id,
            experiment.name,
            encode_json(&experiment.config)?,
            experiment.status.as_str(),
            to_millis(experiment.created_at),
            experiment.started_at.map(to_millis),
            experiment.completed_at.map(to_millis),
            i64::from(experiment.total_conversations),
            i64::from(experiment.completed_conversations),
            i64::from(experiment.failed_conversations),
            experiment.error_message,
        ],
    )?)
}

pub(crate) fn read_experiment(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let config: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        config: decode_json_row(&config)?,
        status: parse_enum(&status, RunStatus::parse)?,
        created_at: from_millis(row.get(4)?),
        started_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        total_conversations: to_u32(row.get(7)?),
        completed_conversations: to_u32(row.get(8)?),
        failed_conversations: to_u32(row.get(9)?),
        error_message: row.get(10)?,
    })
}

pub(crate) fn upsert_conversation(
    conn: &Connection,
    conversation: &Conversation,
) -> StoreResult<usize> {
    let agent_a = conversation.config.agent_a.as_ref();
    let agent_b = conversation.config.agent_b.as_ref();
    Ok(conn.execute(
        "INSERT INTO conversations (conversation_id, experiment_id, status, end_reason,
                                    agent_a_model, agent_b_model, agent_a_temperature,
                                    agent_b_temperature, initial_prompt, max_turns, config,
                                    total_turns, final_convergence_score, created_at,
                                    started_at, completed_at, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT (conversation_id)
         DO UPDATE SET experiment_id = excluded.experiment_id,
                       status = excluded.status,
                       end_reason = excluded.end_reason,
                       agent_a_model = excluded.agent_a_model,
                       agent_b_model = excluded.agent_b_model,
                       agent_a_temperature = excluded.agent_a_temperature,
                       agent_b_temperature = excluded.agent_b_temperature,
                       initial_prompt = excluded.initial_prompt,
                       max_turns = excluded.max_turns,
                       config = excluded.config,
                       total_turns = excluded.total_turns,
                       final_convergence_score = excluded.final_convergence_score,
                       started_at = excluded.started_at,
                       completed_at = excluded.completed_at,
                       error_message = excluded.error_message",
        params![
            conversation.id,
            conversation.experiment_id,
            conversation.status.as_str(),
            conversation.end_reason,
            agent_a.map(|agent| agent.model.clone()),
            agent_b.map(|agent| agent.model.clone()),
            agent_a.and_then(|agent| agent.temperature),
            agent_b.and_then(|agent| agent.temperature),
            conversation.config.initial_prompt,
            conversation.config.max_turns.map(i64::from),
            encode_json(&conversation.config)?,
            i64::from(conversation.total_turns),
            conversation.final_convergence_score,
            to_millis(conversation.created_at),
            conversation.started_at.map(to_millis),
            conversation.completed_at.map(to_millis),
            conversation.error_message,
        ],
    )?)
}

pub(crate) fn read_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let status: String = row.get(2)?;
    let config: String = row.get(4)?;
    let config: ConversationConfig = decode_json_row(&config)?;
    Ok(Conversation {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        status: parse_enum(&status, RunStatus::parse)?,
        end_reason: row.get(3)?,
        config,
        total_turns: to_u32(row.get(5)?),
        final_convergence_score: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        started_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        error_message: row.get(10)?,
    })
}

pub(crate) fn find_experiment(conn: &Connection, id: &str) -> rusqlite::Result<Option<Experiment>> {
    conn.query_row(
        &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE experiment_id = ?1"),
        [id],
        read_experiment,
    )
    .optional()
}

pub(crate) fn find_conversation(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = ?1"),
        [id],
        read_conversation,
    )
    .optional()
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode_json_row<T: DeserializeOwned>(value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

fn option_f64_to_value(value: Option<f64>) -> SqlValue {
    match value {
        Some(number) => SqlValue::Real(number),
        None => SqlValue::Null,
    }
}

fn option_i64_to_value(value: Option<i64>) -> SqlValue {
    match value {
        Some(number) => SqlValue::Integer(number),
        None => SqlValue::Null,
    }
}

fn option_text_to_value(value: Option<String>) -> SqlValue {
    match value {
        Some(text) => SqlValue::Text(text),
        None => SqlValue::Null,
    }
}

fn parse_enum<T>(value: &str, parser: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parser(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid enum value: {value}"),
            )),
        )
    })
}
