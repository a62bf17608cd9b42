use chrono::{DateTime, NaiveDateTime, Utc};
use colloquy_types::{
    AgentConfig, ConversationState, Event, EventKind, ReplayedMessage, RunStatus, AGENT_A,
    AGENT_B,
};
use serde_json::{Map, Value};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::StoreResult;

/// A log line that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ReplayError {
    pub line: usize,
    pub message: String,
}

impl ReplayError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    pub events: Vec<Event>,
    pub skipped: Vec<ReplayError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub state: ConversationState,
    pub events: Vec<Event>,
    pub skipped: Vec<ReplayError>,
}

/// Folds an event stream into a [`ConversationState`]. Pure: the result
/// depends only on the events given.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayEngine;

impl ReplayEngine {
    /// Orders `events` by `(timestamp, sequence)` and folds them from an
    /// empty state.
    pub fn replay(events: &[Event]) -> ConversationState {
        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by(|a, b| (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)));
        ordered
            .into_iter()
            .fold(ConversationState::default(), Self::apply)
    }

    pub fn replay_file(path: &Path) -> StoreResult<ReplayOutcome> {
        let source = path.display().to_string();
        let parsed = read_event_log(path, &source)?;
        let state = Self::replay(&parsed.events);
        Ok(ReplayOutcome {
            state,
            events: parsed.events,
            skipped: parsed.skipped,
        })
    }

    pub fn apply(mut state: ConversationState, event: &Event) -> ConversationState {
        state.events_applied += 1;
        if state.conversation_id.is_none() {
            state.conversation_id = event.conversation_id.clone();
        }
        if state.experiment_id.is_none() {
            state.experiment_id = event.experiment_id.clone();
        }

        match &event.kind {
            EventKind::ConversationCreated(created) => {
                state.experiment_id.get_or_insert_with(|| created.experiment_id.clone());
                if state.agent_a.is_none() {
                    state.agent_a = created.config.agent_a.clone();
                }
                if state.agent_b.is_none() {
                    state.agent_b = created.config.agent_b.clone();
                }
                if state.initial_prompt.is_none() {
                    state.initial_prompt = created.config.initial_prompt.clone();
                }
                if state.max_turns.is_none() {
                    state.max_turns = created.config.max_turns;
                }
            }
            EventKind::ConversationStart(start) => {
                state.agent_a = Some(AgentConfig {
                    agent_id: start.agent_a_id.clone(),
                    model: start.agent_a_model.clone(),
                    temperature: start.agent_a_temperature,
                });
                state.agent_b = Some(AgentConfig {
                    agent_id: start.agent_b_id.clone(),
                    model: start.agent_b_model.clone(),
                    temperature: start.agent_b_temperature,
                });
                state.initial_prompt = start.initial_prompt.clone();
                state.max_turns = start.max_turns;
                state.started_at = Some(event.timestamp);
                state.status = RunStatus::Running;
            }
            EventKind::MessageComplete(message) => {
                *state
                    .pending_tokens
                    .entry(message.agent_id.clone())
                    .or_insert(0) += message.tokens;
            }
            EventKind::TurnComplete(turn) => {
                state.total_turns = state
                    .total_turns
                    .saturating_add(1)
                    .max(turn.turn_number);
                let sides = [
                    (&state.agent_a, AGENT_A, &turn.turn.agent_a_message),
                    (&state.agent_b, AGENT_B, &turn.turn.agent_b_message),
                ];
                let mut recorded = Vec::new();
                for (agent, fallback_id, message) in sides {
                    let Some(message) = message else {
                        continue;
                    };
                    if message.content.trim().is_empty() {
                        continue;
                    }
                    let agent_id = message
                        .agent_id
                        .clone()
                        .or_else(|| agent.as_ref().map(|agent| agent.agent_id.clone()))
                        .unwrap_or_else(|| fallback_id.to_string());
                    let token_count = message
                        .tokens_used
                        .or_else(|| state.pending_tokens.get(&agent_id).copied());
                    let model = message
                        .model
                        .clone()
                        .or_else(|| agent.as_ref().map(|agent| agent.model.clone()));
                    recorded.push(ReplayedMessage {
                        turn_number: turn.turn_number,
                        agent_id,
                        content: message.content.clone(),
                        token_count,
                        model,
                    });
                }
                state.messages.extend(recorded);
                if let Some(score) = turn.convergence_score {
                    state.final_convergence_score = Some(score);
                    state.turn_scores.insert(turn.turn_number, score);
                }
                state.pending_tokens.clear();
            }
            EventKind::ConversationEnd(end) if state.status.is_terminal() => {
                debug!(status = %state.status, reason = %end.reason, "ignoring end of a finished conversation");
            }
            EventKind::ConversationEnd(end) => {
                state.completed_at = Some(event.timestamp);
                state.end_reason = Some(end.reason.clone());
                state.status = RunStatus::from_end_reason(&end.reason);
                if let Some(total) = end.total_turns {
                    state.total_turns = state.total_turns.max(total);
                }
                if end.final_convergence_score.is_some() {
                    state.final_convergence_score = end.final_convergence_score;
                }
            }
            EventKind::ConversationStatusChanged(change) => {
                if state.status.can_transition_to(change.status) {
                    state.status = change.status;
                    if change.status == RunStatus::Running {
                        state.started_at.get_or_insert(event.timestamp);
                    }
                    if change.status.is_terminal() {
                        state.completed_at = Some(event.timestamp);
                        if change.reason.is_some() {
                            state.end_reason = change.reason.clone();
                        }
                    }
                    if change.final_convergence_score.is_some() {
                        state.final_convergence_score = change.final_convergence_score;
                    }
                } else {
                    debug!(from = %state.status, to = %change.status, "ignoring status change during replay");
                }
            }
            EventKind::ExperimentCreated(_)
            | EventKind::ExperimentStatusChanged(_)
            | EventKind::Opaque { .. } => {}
        }
        state
    }
}

/// Parses one line of an offline event log. Missing `sequence` defaults to
/// the line number; a missing `event_id` is derived from the line itself so
/// re-reading the same file yields the same ids.
pub fn parse_event_line(line: &str, line_no: usize, source: &str) -> Result<Event, ReplayError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| ReplayError::new(line_no, format!("invalid json: {err}")))?;
    let Value::Object(mut object) = value else {
        return Err(ReplayError::new(line_no, "expected a JSON object"));
    };

    let event_type = take_string(&mut object, "event_type")
        .filter(|tag| !tag.is_empty())
        .ok_or_else(|| ReplayError::new(line_no, "missing event_type"))?;
    let timestamp = object
        .remove("timestamp")
        .as_ref()
        .and_then(parse_timestamp)
        .ok_or_else(|| ReplayError::new(line_no, "missing or unreadable timestamp"))?;
    let conversation_id = take_string(&mut object, "conversation_id");
    let experiment_id = take_string(&mut object, "experiment_id");
    let sequence = object
        .remove("sequence")
        .and_then(|value| value.as_i64())
        .unwrap_or(i64::try_from(line_no).unwrap_or(i64::MAX));
    let event_id = take_string(&mut object, "event_id").unwrap_or_else(|| {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{source}:{line_no}:{line}").as_bytes(),
        )
        .to_string()
    });
    let payload = match object.remove("payload") {
        Some(Value::Object(payload)) => Value::Object(payload),
        Some(Value::Null) | None => Value::Object(object),
        Some(_) => return Err(ReplayError::new(line_no, "payload must be an object")),
    };
    let kind = EventKind::from_parts(&event_type, payload)
        .map_err(|err| ReplayError::new(line_no, format!("invalid {event_type} payload: {err}")))?;

    Ok(Event {
        event_id,
        timestamp,
        conversation_id,
        experiment_id,
        sequence,
        kind,
    })
}

/// Reads a JSON-lines event log. Bad lines are collected in
/// [`ParsedLog::skipped`] and logged; only I/O failures are errors.
pub fn read_event_log(path: &Path, source: &str) -> StoreResult<ParsedLog> {
    let file = std::fs::File::open(path)?;
    let mut parsed = ParsedLog::default();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_event_line(&line, line_no, source) {
            Ok(event) => parsed.events.push(event),
            Err(err) => {
                warn!(source, line = err.line, error = %err.message, "skipping malformed event line");
                parsed.skipped.push(err);
            }
        }
    }
    debug!(source, events = parsed.events.len(), skipped = parsed.skipped.len(), "read event log");
    Ok(parsed)
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(value)) => Some(value),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(number) => {
            let seconds = number.as_f64()?;
            DateTime::<Utc>::from_timestamp_millis((seconds * 1000.0).round() as i64)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::tags;
    use serde_json::json;

    const LOG: &str = r#"{"event_type":"conversation_start","timestamp":"2024-05-01T10:00:00Z","conversation_id":"c1","experiment_id":"e1","agent_a_model":"model-a","agent_b_model":"model-b","agent_a_temperature":0.7,"initial_prompt":"Discuss tides.","max_turns":3}
{"event_type":"message_complete","timestamp":"2024-05-01T10:00:01Z","conversation_id":"c1","agent_id":"agent_a","tokens":12}
{"event_type": "turn_complete", "timestamp": broken
{"event_type":"turn_complete","timestamp":"2024-05-01T10:00:02Z","conversation_id":"c1","turn_number":1,"turn":{"agent_a_message":{"content":"Tides follow the moon."},"agent_b_message":{"content":"And the sun.","tokens_used":4}},"convergence_score":0.42}
{"event_type":"conversation_end","timestamp":"2024-05-01T10:00:03Z","conversation_id":"c1","reason":"max_turns"}
"#;

    fn write_log(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("c1.jsonl");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn malformed_line_is_skipped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = ReplayEngine::replay_file(&write_log(&dir, LOG)).unwrap();

        assert_eq!(outcome.events.len(), 4);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].line, 3);

        let state = outcome.state;
        assert_eq!(state.events_applied, 4);
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.total_turns, 1);
        assert_eq!(state.final_convergence_score, Some(0.42));
        assert_eq!(state.end_reason.as_deref(), Some("max_turns"));
        assert_eq!(state.conversation_id.as_deref(), Some("c1"));
        assert_eq!(state.agent_a.as_ref().unwrap().temperature, Some(0.7));

        let turn: Vec<_> = state.messages_for_turn(1).collect();
        assert_eq!(turn.len(), 2);
        assert_eq!(turn[0].token_count, Some(12));
        assert_eq!(turn[0].model.as_deref(), Some("model-a"));
        assert_eq!(turn[1].token_count, Some(4));
        assert!(state.pending_tokens.is_empty());
    }

    #[test]
    fn replay_is_deterministic_and_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read_event_log(&write_log(&dir, LOG), "fixture").unwrap();
        let first = ReplayEngine::replay(&parsed.events);
        let second = ReplayEngine::replay(&parsed.events);
        assert_eq!(first, second);

        let mut shuffled = parsed.events.clone();
        shuffled.reverse();
        assert_eq!(ReplayEngine::replay(&shuffled), first);

        let again = read_event_log(&write_log(&dir, LOG), "fixture").unwrap();
        let ids: Vec<_> = again.events.iter().map(|e| e.event_id.clone()).collect();
        let original: Vec<_> = parsed.events.iter().map(|e| e.event_id.clone()).collect();
        assert_eq!(ids, original);
    }

    #[test]
    fn empty_messages_are_not_recorded() {
        let event = parse_event_line(
            &json!({
                "event_type": tags::TURN_COMPLETE,
                "timestamp": 1714557600.5,
                "turn_number": 4,
                "turn": {"agent_a_message": {"content": "  "}, "agent_b_message": {"content": "ok"}}
            })
            .to_string(),
            1,
            "inline",
        )
        .unwrap();
        let state = ReplayEngine::replay(&[event]);
        assert_eq!(state.total_turns, 4);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].agent_id, AGENT_B);
        assert_eq!(state.final_convergence_score, None);
    }

    #[test]
    fn status_changes_after_the_end_are_ignored() {
        let lines = [
            json!({"event_type": "conversation_end", "timestamp": "2024-05-01T10:00:00", "reason": "error"}),
            json!({"event_type": "conversation_status_changed", "timestamp": "2024-05-01T10:00:01", "status": "running"}),
        ];
        let events: Vec<Event> = lines
            .iter()
            .enumerate()
            .map(|(idx, line)| parse_event_line(&line.to_string(), idx + 1, "inline").unwrap())
            .collect();
        let state = ReplayEngine::replay(&events);
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.events_applied, 2);
    }

    #[test]
    fn second_end_does_not_reopen_a_finished_conversation() {
        let lines = [
            json!({"event_type": "conversation_end", "timestamp": "2024-05-01T10:00:00Z", "reason": "max_turns"}),
            json!({"event_type": "conversation_end", "timestamp": "2024-05-01T10:00:05Z", "reason": "error"}),
        ];
        let events: Vec<Event> = lines
            .iter()
            .enumerate()
            .map(|(idx, line)| parse_event_line(&line.to_string(), idx + 1, "inline").unwrap())
            .collect();
        let state = ReplayEngine::replay(&events);
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.end_reason.as_deref(), Some("max_turns"));
        assert_eq!(state.completed_at, Some(events[0].timestamp));
        assert_eq!(state.events_applied, 2);
    }

    #[test]
    fn lines_without_required_fields_are_rejected() {
        let missing_type = parse_event_line(r#"{"timestamp":"2024-05-01T10:00:00Z"}"#, 7, "x");
        assert_eq!(missing_type.unwrap_err().line, 7);
        assert!(parse_event_line(r#"{"event_type":"turn_complete"}"#, 1, "x").is_err());
        assert!(parse_event_line("[1, 2]", 1, "x").is_err());

        let opaque = parse_event_line(
            r#"{"event_type":"agent_thinking","timestamp":"2024-05-01T10:00:00Z","depth":2}"#,
            3,
            "x",
        )
        .unwrap();
        assert_eq!(opaque.sequence, 3);
        assert_eq!(opaque.kind.payload().unwrap(), json!({"depth": 2}));
    }
}
