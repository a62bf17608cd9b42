use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub type JsonMap = BTreeMap<String, serde_json::Value>;

pub const AGENT_A: &str = "agent_a";
pub const AGENT_B: &str = "agent_b";

/// Lifecycle shared by experiments and conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(RunStatus::Created),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "interrupted" => Some(RunStatus::Interrupted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Interrupted
        )
    }

    /// Maps a conversation end reason onto a terminal status. Reasons outside
    /// the known set map to `Interrupted`.
    pub fn from_end_reason(reason: &str) -> Self {
        match reason {
            "max_turns" | "high_convergence" => RunStatus::Completed,
            "error" => RunStatus::Failed,
            _ => RunStatus::Interrupted,
        }
    }

    /// `created -> running -> {completed, failed, interrupted}`; a created run
    /// may also end directly. Nothing leaves a terminal status.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunStatus::Created => false,
            RunStatus::Running => *self == RunStatus::Created,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Interrupted => true,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_conversations: u32,
    #[serde(default)]
    pub completed_conversations: u32,
    #[serde(default)]
    pub failed_conversations: u32,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent_id: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationConfig {
    #[serde(default)]
    pub agent_a: Option<AgentConfig>,
    #[serde(default)]
    pub agent_b: Option<AgentConfig>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub experiment_id: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub end_reason: Option<String>,
    #[serde(default)]
    pub config: ConversationConfig,
    #[serde(default)]
    pub total_turns: u32,
    #[serde(default)]
    pub final_convergence_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Per-turn analytics produced outside the store. Every field is optional so
/// producers can log whatever subset they computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TurnMetrics {
    #[serde(default)]
    pub convergence_score: Option<f64>,
    #[serde(default)]
    pub vocabulary_overlap: Option<f64>,
    #[serde(default)]
    pub structural_similarity: Option<f64>,
    #[serde(default)]
    pub semantic_similarity: Option<f64>,
    #[serde(default)]
    pub sentiment_similarity: Option<f64>,
    #[serde(default)]
    pub formality_similarity: Option<f64>,
    #[serde(default)]
    pub pronoun_similarity: Option<f64>,
    #[serde(default)]
    pub question_alignment: Option<f64>,
    #[serde(default)]
    pub repetition_rate_a: Option<f64>,
    #[serde(default)]
    pub repetition_rate_b: Option<f64>,
    #[serde(default)]
    pub length_ratio: Option<f64>,
    #[serde(default)]
    pub message_a_length: Option<i64>,
    #[serde(default)]
    pub message_b_length: Option<i64>,
    #[serde(default)]
    pub message_a_word_count: Option<i64>,
    #[serde(default)]
    pub message_b_word_count: Option<i64>,
    #[serde(default)]
    pub message_a_tokens: Option<i64>,
    #[serde(default)]
    pub message_b_tokens: Option<i64>,
    #[serde(default)]
    pub shared_vocabulary_size: Option<i64>,
    #[serde(default)]
    pub dominant_style: Option<String>,
    #[serde(default)]
    pub vocabulary_a: Vec<String>,
    #[serde(default)]
    pub vocabulary_b: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMetricsRecord {
    pub conversation_id: String,
    pub turn_number: u32,
    #[serde(flatten)]
    pub metrics: TurnMetrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    pub turn_number: u32,
    pub agent_id: String,
    pub content: String,
    #[serde(default)]
    pub token_count: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

/// One entry of the append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub experiment_id: Option<String>,
    pub sequence: i64,
    pub kind: EventKind,
}

impl Event {
    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }
}

pub mod tags {
    pub const EXPERIMENT_CREATED: &str = "experiment_created";
    pub const EXPERIMENT_STATUS_CHANGED: &str = "experiment_status_changed";
    pub const CONVERSATION_CREATED: &str = "conversation_created";
    pub const CONVERSATION_STATUS_CHANGED: &str = "conversation_status_changed";
    pub const CONVERSATION_START: &str = "conversation_start";
    pub const MESSAGE_COMPLETE: &str = "message_complete";
    pub const TURN_COMPLETE: &str = "turn_complete";
    pub const CONVERSATION_END: &str = "conversation_end";
}

/// Typed event payloads keyed by their `event_type` tag. Tags this crate does
/// not know about are carried verbatim in `Opaque`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ExperimentCreated(ExperimentCreated),
    ExperimentStatusChanged(ExperimentStatusChanged),
    ConversationCreated(ConversationCreated),
    ConversationStatusChanged(ConversationStatusChanged),
    ConversationStart(ConversationStart),
    MessageComplete(MessageComplete),
    TurnComplete(TurnComplete),
    ConversationEnd(ConversationEnd),
    Opaque { event_type: String, payload: Value },
}

impl EventKind {
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::ExperimentCreated(_) => tags::EXPERIMENT_CREATED,
            EventKind::ExperimentStatusChanged(_) => tags::EXPERIMENT_STATUS_CHANGED,
            EventKind::ConversationCreated(_) => tags::CONVERSATION_CREATED,
            EventKind::ConversationStatusChanged(_) => tags::CONVERSATION_STATUS_CHANGED,
            EventKind::ConversationStart(_) => tags::CONVERSATION_START,
            EventKind::MessageComplete(_) => tags::MESSAGE_COMPLETE,
            EventKind::TurnComplete(_) => tags::TURN_COMPLETE,
            EventKind::ConversationEnd(_) => tags::CONVERSATION_END,
            EventKind::Opaque { event_type, .. } => event_type,
        }
    }

    /// Rebuilds a typed payload from its tag and JSON body.
    pub fn from_parts(event_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            tags::EXPERIMENT_CREATED => EventKind::ExperimentCreated(serde_json::from_value(payload)?),
            tags::EXPERIMENT_STATUS_CHANGED => {
                EventKind::ExperimentStatusChanged(serde_json::from_value(payload)?)
            }
            tags::CONVERSATION_CREATED => {
                EventKind::ConversationCreated(serde_json::from_value(payload)?)
            }
            tags::CONVERSATION_STATUS_CHANGED => {
                EventKind::ConversationStatusChanged(serde_json::from_value(payload)?)
            }
            tags::CONVERSATION_START => EventKind::ConversationStart(serde_json::from_value(payload)?),
            tags::MESSAGE_COMPLETE => EventKind::MessageComplete(serde_json::from_value(payload)?),
            tags::TURN_COMPLETE => EventKind::TurnComplete(serde_json::from_value(payload)?),
            tags::CONVERSATION_END => EventKind::ConversationEnd(serde_json::from_value(payload)?),
            other => EventKind::Opaque {
                event_type: other.to_string(),
                payload,
            },
        })
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventKind::ExperimentCreated(p) => serde_json::to_value(p),
            EventKind::ExperimentStatusChanged(p) => serde_json::to_value(p),
            EventKind::ConversationCreated(p) => serde_json::to_value(p),
            EventKind::ConversationStatusChanged(p) => serde_json::to_value(p),
            EventKind::ConversationStart(p) => serde_json::to_value(p),
            EventKind::MessageComplete(p) => serde_json::to_value(p),
            EventKind::TurnComplete(p) => serde_json::to_value(p),
            EventKind::ConversationEnd(p) => serde_json::to_value(p),
            EventKind::Opaque { payload, .. } => Ok(payload.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentCreated {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatusChanged {
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub experiment_id: String,
    #[serde(default)]
    pub config: ConversationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationStatusChanged {
    pub status: RunStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub final_convergence_score: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationStart {
    #[serde(default = "default_agent_a")]
    pub agent_a_id: String,
    #[serde(default = "default_agent_b")]
    pub agent_b_id: String,
    pub agent_a_model: String,
    pub agent_b_model: String,
    #[serde(default)]
    pub agent_a_temperature: Option<f64>,
    #[serde(default)]
    pub agent_b_temperature: Option<f64>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageComplete {
    pub agent_id: String,
    #[serde(default)]
    pub turn_number: Option<u32>,
    #[serde(default, alias = "tokens_used")]
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnComplete {
    pub turn_number: u32,
    #[serde(default)]
    pub turn: TurnRecord,
    #[serde(default)]
    pub convergence_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TurnRecord {
    #[serde(default)]
    pub agent_a_message: Option<TurnMessage>,
    #[serde(default)]
    pub agent_b_message: Option<TurnMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TurnMessage {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "tokens")]
    pub tokens_used: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEnd {
    pub reason: String,
    #[serde(default)]
    pub total_turns: Option<u32>,
    #[serde(default)]
    pub final_convergence_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayedMessage {
    pub turn_number: u32,
    pub agent_id: String,
    pub content: String,
    #[serde(default)]
    pub token_count: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Point-in-time view of a conversation rebuilt from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationState {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub agent_a: Option<AgentConfig>,
    #[serde(default)]
    pub agent_b: Option<AgentConfig>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_reason: Option<String>,
    #[serde(default)]
    pub total_turns: u32,
    #[serde(default)]
    pub final_convergence_score: Option<f64>,
    #[serde(default)]
    pub messages: Vec<ReplayedMessage>,
    #[serde(default)]
    pub turn_scores: BTreeMap<u32, f64>,
    /// Tokens reported by message-complete events since the last turn.
    #[serde(default)]
    pub pending_tokens: BTreeMap<String, i64>,
    #[serde(default)]
    pub events_applied: usize,
}

impl ConversationState {
    pub fn messages_for_turn(&self, turn_number: u32) -> impl Iterator<Item = &ReplayedMessage> {
        self.messages
            .iter()
            .filter(move |m| m.turn_number == turn_number)
    }

    /// Builds the configuration a persisted conversation row would carry.
    pub fn config(&self) -> ConversationConfig {
        ConversationConfig {
            agent_a: self.agent_a.clone(),
            agent_b: self.agent_b.clone(),
            initial_prompt: self.initial_prompt.clone(),
            max_turns: self.max_turns,
            extra: JsonMap::new(),
        }
    }
}

fn default_agent_a() -> String {
    AGENT_A.to_string()
}

fn default_agent_b() -> String {
    AGENT_B.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn end_reasons_map_to_terminal_statuses() {
        assert_eq!(RunStatus::from_end_reason("max_turns"), RunStatus::Completed);
        assert_eq!(
            RunStatus::from_end_reason("high_convergence"),
            RunStatus::Completed
        );
        assert_eq!(RunStatus::from_end_reason("error"), RunStatus::Failed);
        assert_eq!(
            RunStatus::from_end_reason("user_abort"),
            RunStatus::Interrupted
        );
    }

    #[test]
    fn terminal_statuses_are_final() {
        assert!(RunStatus::Created.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Created.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Created));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn unknown_tags_become_opaque() {
        let kind = EventKind::from_parts("agent_thinking", json!({"depth": 3})).unwrap();
        assert_eq!(kind.event_type(), "agent_thinking");
        assert_eq!(kind.payload().unwrap(), json!({"depth": 3}));
    }

    #[test]
    fn turn_complete_reads_nested_messages() {
        let kind = EventKind::from_parts(
            tags::TURN_COMPLETE,
            json!({
                "turn_number": 2,
                "turn": {
                    "agent_a_message": {"content": "hello", "tokens_used": 4},
                    "agent_b_message": {"content": "hi", "tokens": 2}
                },
                "convergence_score": 0.5
            }),
        )
        .unwrap();
        let EventKind::TurnComplete(turn) = kind else {
            panic!("expected turn_complete");
        };
        assert_eq!(turn.turn_number, 2);
        assert_eq!(turn.turn.agent_b_message.unwrap().tokens_used, Some(2));
        assert_eq!(turn.convergence_score, Some(0.5));
    }

    #[test]
    fn known_tag_with_bad_body_is_an_error() {
        assert!(EventKind::from_parts(tags::CONVERSATION_START, json!({"initial_prompt": "x"})).is_err());
    }
}
