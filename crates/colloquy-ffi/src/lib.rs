use chrono::{DateTime, TimeZone, Utc};
use colloquy_store::{
    AsyncEventStore, EventFilter, EventStore, ImportService, ReplayEngine, StatusUpdate,
    StoreConfig, StoreError,
};
use colloquy_types::{ConversationConfig, Event, EventKind, Message, RunStatus, TurnMetrics};
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

#[pyclass]
struct ColloquyStore {
    inner: AsyncEventStore,
}

impl ColloquyStore {
    fn store(&self) -> &EventStore {
        self.inner.store()
    }
}

#[pymethods]
impl ColloquyStore {
    #[new]
    #[pyo3(signature = (path, read_only=false, config_file=None, batch_size=None))]
    fn new(
        path: String,
        read_only: bool,
        config_file: Option<String>,
        batch_size: Option<usize>,
    ) -> PyResult<Self> {
        let config = build_config(path, read_only, config_file, batch_size).map_err(store_error)?;
        let store = EventStore::open(config).map_err(store_error)?;
        Ok(Self {
            inner: AsyncEventStore::new(store),
        })
    }

    #[getter]
    fn path(&self) -> String {
        self.store().config().path.display().to_string()
    }

    #[getter]
    fn closed(&self) -> bool {
        self.store().is_closed()
    }

    fn append_event(&self, event_json: &str) -> PyResult<i64> {
        let input: EventInput = parse_json(event_json)?;
        let (kind, conversation_id, experiment_id) = input.into_parts()?;
        self.store()
            .append_event(kind, conversation_id.as_deref(), experiment_id.as_deref())
            .map_err(store_error)
    }

    fn async_append_event<'p>(&self, py: Python<'p>, event_json: String) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let input: EventInput = parse_json(&event_json)?;
            let (kind, conversation_id, experiment_id) = input.into_parts()?;
            store
                .append_event(kind, conversation_id, experiment_id)
                .await
                .map_err(store_error)
        })
    }

    #[pyo3(signature = (name, config_json=None))]
    fn create_experiment(&self, name: &str, config_json: Option<&str>) -> PyResult<String> {
        let config = match config_json {
            Some(payload) => parse_json::<JsonValue>(payload)?,
            None => JsonValue::Object(Default::default()),
        };
        self.store().create_experiment(name, config).map_err(store_error)
    }

    #[pyo3(signature = (experiment_id, conversation_id, config_json=None))]
    fn create_conversation(
        &self,
        experiment_id: &str,
        conversation_id: &str,
        config_json: Option<&str>,
    ) -> PyResult<String> {
        let config = match config_json {
            Some(payload) => parse_json::<ConversationConfig>(payload)?,
            None => ConversationConfig::default(),
        };
        let conversation = self
            .store()
            .create_conversation(experiment_id, conversation_id, config)
            .map_err(store_error)?;
        to_json(&conversation)
    }

    #[pyo3(signature = (conversation_id, status, reason=None, final_convergence_score=None, error=None))]
    fn update_conversation_status(
        &self,
        conversation_id: &str,
        status: &str,
        reason: Option<String>,
        final_convergence_score: Option<f64>,
        error: Option<String>,
    ) -> PyResult<String> {
        let update = status_update(status, reason, final_convergence_score, error)?;
        let conversation = self
            .store()
            .update_conversation_status(conversation_id, update)
            .map_err(store_error)?;
        to_json(&conversation)
    }

    #[pyo3(signature = (conversation_id, status, reason=None, final_convergence_score=None, error=None))]
    fn async_update_conversation_status<'p>(
        &self,
        py: Python<'p>,
        conversation_id: String,
        status: String,
        reason: Option<String>,
        final_convergence_score: Option<f64>,
        error: Option<String>,
    ) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let update = status_update(&status, reason, final_convergence_score, error)?;
            let conversation = store
                .update_conversation_status(conversation_id, update)
                .await
                .map_err(store_error)?;
            to_json(&conversation)
        })
    }

    /// Ends a conversation with a domain reason such as `max_turns` or
    /// `high_convergence`; the terminal status follows from the reason.
    #[pyo3(signature = (conversation_id, reason, final_convergence_score=None))]
    fn end_conversation(
        &self,
        conversation_id: &str,
        reason: &str,
        final_convergence_score: Option<f64>,
    ) -> PyResult<String> {
        let mut update = StatusUpdate::ended(reason);
        update.final_convergence_score = final_convergence_score;
        let conversation = self
            .store()
            .update_conversation_status(conversation_id, update)
            .map_err(store_error)?;
        to_json(&conversation)
    }

    #[pyo3(signature = (experiment_id, status, error=None))]
    fn update_experiment_status(
        &self,
        experiment_id: &str,
        status: &str,
        error: Option<String>,
    ) -> PyResult<String> {
        let status = parse_status(status)?;
        let experiment = self
            .store()
            .update_experiment_status(experiment_id, status, error)
            .map_err(store_error)?;
        to_json(&experiment)
    }

    fn log_turn_metrics(
        &self,
        conversation_id: &str,
        turn_number: u32,
        metrics_json: &str,
    ) -> PyResult<()> {
        let metrics: TurnMetrics = parse_json(metrics_json)?;
        self.store()
            .log_turn_metrics(conversation_id, turn_number, &metrics)
            .map_err(store_error)
    }

    fn async_log_turn_metrics<'p>(
        &self,
        py: Python<'p>,
        conversation_id: String,
        turn_number: u32,
        metrics_json: String,
    ) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let metrics: TurnMetrics = parse_json(&metrics_json)?;
            store
                .log_turn_metrics(conversation_id, turn_number, metrics)
                .await
                .map_err(store_error)
        })
    }

    #[pyo3(signature = (conversation_id, turn_number, agent_id, content, token_count=None, model=None))]
    fn log_message(
        &self,
        conversation_id: &str,
        turn_number: u32,
        agent_id: &str,
        content: &str,
        token_count: Option<i64>,
        model: Option<&str>,
    ) -> PyResult<bool> {
        self.store()
            .log_message(conversation_id, turn_number, agent_id, content, token_count, model)
            .map_err(store_error)
    }

    #[pyo3(signature = (conversation_id, turn_number, agent_id, content, token_count=None, model=None))]
    fn async_log_message<'p>(
        &self,
        py: Python<'p>,
        conversation_id: String,
        turn_number: u32,
        agent_id: String,
        content: String,
        token_count: Option<i64>,
        model: Option<String>,
    ) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let message = Message {
                conversation_id,
                turn_number,
                agent_id,
                content,
                token_count,
                model,
                created_at: Utc::now(),
            };
            store.log_message(message).await.map_err(store_error)
        })
    }

    #[pyo3(signature = (filter_json=None))]
    fn get_events(&self, filter_json: Option<&str>) -> PyResult<String> {
        let filter = match filter_json {
            Some(payload) => parse_json::<FilterInput>(payload)?.to_filter()?,
            None => EventFilter::default(),
        };
        let events = self.store().get_events(&filter).map_err(store_error)?;
        events_to_json(events)
    }

    #[pyo3(signature = (filter_json=None))]
    fn async_get_events<'p>(
        &self,
        py: Python<'p>,
        filter_json: Option<String>,
    ) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let filter = match filter_json {
                Some(payload) => parse_json::<FilterInput>(&payload)?.to_filter()?,
                None => EventFilter::default(),
            };
            let events = store.get_events(filter).await.map_err(store_error)?;
            events_to_json(events)
        })
    }

    fn get_experiment(&self, experiment_id: &str) -> PyResult<Option<String>> {
        match self.store().get_experiment(experiment_id).map_err(store_error)? {
            Some(experiment) => Ok(Some(to_json(&experiment)?)),
            None => Ok(None),
        }
    }

    fn get_conversation(&self, conversation_id: &str) -> PyResult<Option<String>> {
        match self
            .store()
            .get_conversation(conversation_id)
            .map_err(store_error)?
        {
            Some(conversation) => Ok(Some(to_json(&conversation)?)),
            None => Ok(None),
        }
    }

    fn list_conversations(&self, experiment_id: &str) -> PyResult<String> {
        let conversations = self
            .store()
            .list_conversations(experiment_id)
            .map_err(store_error)?;
        to_json(&conversations)
    }

    fn get_turn_metrics(&self, conversation_id: &str) -> PyResult<String> {
        let metrics = self
            .store()
            .get_turn_metrics(conversation_id)
            .map_err(store_error)?;
        to_json(&metrics)
    }

    fn get_messages(&self, conversation_id: &str) -> PyResult<String> {
        let messages = self.store().get_messages(conversation_id).map_err(store_error)?;
        to_json(&messages)
    }

    fn experiment_summary(&self, experiment_id: &str) -> PyResult<String> {
        let summary = self
            .store()
            .experiment_summary(experiment_id)
            .map_err(store_error)?;
        to_json(&summary)
    }

    fn flush(&self) -> PyResult<String> {
        let report = self.store().flush().map_err(store_error)?;
        to_json(&report)
    }

    fn async_flush<'p>(&self, py: Python<'p>) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let report = store.flush().await.map_err(store_error)?;
            to_json(&report)
        })
    }

    fn stats(&self) -> PyResult<String> {
        to_json(&self.store().stats())
    }

    fn import_directory(&self, dir: &str) -> PyResult<String> {
        let result = ImportService::new(self.store()).import(Path::new(dir));
        to_json(&result)
    }

    fn async_import_directory<'p>(&self, py: Python<'p>, dir: String) -> PyResult<&'p PyAny> {
        let store = self.inner.clone();
        pyo3_asyncio::tokio::future_into_py(py, async move {
            let result = store
                .import(PathBuf::from(dir))
                .await
                .map_err(store_error)?;
            to_json(&result)
        })
    }

    fn import_all(&self, root: &str) -> PyResult<String> {
        let report = ImportService::new(self.store())
            .import_all(Path::new(root))
            .map_err(store_error)?;
        to_json(&report)
    }

    fn close(&self) -> PyResult<()> {
        self.inner.close_blocking().map_err(store_error)
    }
}

/// Creates a new database file with the full schema.
#[pyfunction]
fn create_database(path: &str) -> PyResult<String> {
    let report = colloquy_store::create_fresh(Path::new(path)).map_err(store_error)?;
    to_json(&report)
}

#[pyfunction]
fn migrate_database(path: &str) -> PyResult<String> {
    let report = colloquy_store::migrate(Path::new(path)).map_err(store_error)?;
    to_json(&report)
}

#[pyfunction]
fn reset_database(path: &str) -> PyResult<String> {
    let report = colloquy_store::reset(Path::new(path)).map_err(store_error)?;
    to_json(&report)
}

#[pyfunction]
fn database_status(path: &str) -> PyResult<String> {
    let report = colloquy_store::status(Path::new(path)).map_err(store_error)?;
    to_json(&report)
}

/// Rebuilds conversation state from a JSONL event log without touching a
/// database.
#[pyfunction]
fn replay_file(path: &str) -> PyResult<String> {
    let outcome = ReplayEngine::replay_file(Path::new(path)).map_err(store_error)?;
    let output = ReplayOutput {
        skipped: outcome.skipped.iter().map(ToString::to_string).collect(),
        events: outcome.events.len(),
        state: outcome.state,
    };
    to_json(&output)
}

#[pymodule]
fn _core(_py: Python, module: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    module.add_class::<ColloquyStore>()?;
    module.add_function(wrap_pyfunction!(create_database, module)?)?;
    module.add_function(wrap_pyfunction!(migrate_database, module)?)?;
    module.add_function(wrap_pyfunction!(reset_database, module)?)?;
    module.add_function(wrap_pyfunction!(database_status, module)?)?;
    module.add_function(wrap_pyfunction!(replay_file, module)?)?;
    Ok(())
}

#[derive(Deserialize)]
struct EventInput {
    event_type: String,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    experiment_id: Option<String>,
}

impl EventInput {
    fn into_parts(self) -> PyResult<(EventKind, Option<String>, Option<String>)> {
        if self.event_type.trim().is_empty() {
            return Err(PyValueError::new_err("event_type must not be empty"));
        }
        let payload = match self.payload {
            JsonValue::Null => JsonValue::Object(Default::default()),
            other => other,
        };
        let kind = EventKind::from_parts(&self.event_type, payload).map_err(py_error)?;
        Ok((kind, self.conversation_id, self.experiment_id))
    }
}

#[derive(Serialize)]
struct EventOutput {
    event_id: String,
    ts: String,
    ts_ms: i64,
    event_type: String,
    conversation_id: Option<String>,
    experiment_id: Option<String>,
    sequence: i64,
    payload: JsonValue,
}

impl EventOutput {
    fn from_event(event: Event) -> PyResult<Self> {
        let payload = event.kind.payload().map_err(py_error)?;
        Ok(Self {
            event_type: event.event_type().to_string(),
            ts: event.timestamp.to_rfc3339(),
            ts_ms: event.timestamp.timestamp_millis(),
            event_id: event.event_id,
            conversation_id: event.conversation_id,
            experiment_id: event.experiment_id,
            sequence: event.sequence,
            payload,
        })
    }
}

#[derive(Deserialize)]
struct FilterInput {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    experiment_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    since_ms: Option<i64>,
    #[serde(default)]
    until: Option<String>,
    #[serde(default)]
    until_ms: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
}

impl FilterInput {
    fn to_filter(self) -> PyResult<EventFilter> {
        Ok(EventFilter {
            conversation_id: self.conversation_id,
            experiment_id: self.experiment_id,
            event_type: self.event_type,
            since: parse_optional_timestamp(self.since_ms, self.since)?,
            until: parse_optional_timestamp(self.until_ms, self.until)?,
            limit: self.limit,
        })
    }
}

#[derive(Serialize)]
struct ReplayOutput {
    state: colloquy_types::ConversationState,
    events: usize,
    skipped: Vec<String>,
}

fn build_config(
    path: String,
    read_only: bool,
    config_file: Option<String>,
    batch_size: Option<usize>,
) -> Result<StoreConfig, StoreError> {
    let mut config = match config_file {
        Some(file) => StoreConfig::from_json_file(file)?,
        None => StoreConfig::default(),
    }
    .apply_env()
    .read_only(read_only);
    config.path = PathBuf::from(path);
    if let Some(batch_size) = batch_size {
        config = config.with_batch_size(batch_size);
    }
    config.validate()?;
    Ok(config)
}

fn status_update(
    status: &str,
    reason: Option<String>,
    final_convergence_score: Option<f64>,
    error: Option<String>,
) -> PyResult<StatusUpdate> {
    let mut update = StatusUpdate::new(parse_status(status)?);
    update.reason = reason;
    update.final_convergence_score = final_convergence_score;
    update.error = error;
    Ok(update)
}

fn parse_status(value: &str) -> PyResult<RunStatus> {
    RunStatus::parse(value)
        .ok_or_else(|| PyValueError::new_err(format!("invalid status: {value}")))
}

fn events_to_json(events: Vec<Event>) -> PyResult<String> {
    let output = events
        .into_iter()
        .map(EventOutput::from_event)
        .collect::<PyResult<Vec<_>>>()?;
    to_json(&output)
}

fn parse_json<T: DeserializeOwned>(payload: &str) -> PyResult<T> {
    serde_json::from_str(payload).map_err(py_error)
}

fn to_json<T: Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(py_error)
}

fn parse_optional_timestamp(
    ts_ms: Option<i64>,
    ts: Option<String>,
) -> PyResult<Option<DateTime<Utc>>> {
    match (ts_ms, ts) {
        (Some(ms), _) => Ok(Some(parse_millis(ms)?)),
        (None, Some(text)) => Ok(Some(parse_rfc3339(&text)?)),
        (None, None) => Ok(None),
    }
}

fn parse_millis(ms: i64) -> PyResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| PyValueError::new_err("invalid millisecond timestamp"))
}

fn parse_rfc3339(value: &str) -> PyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(py_error)
}

fn store_error(err: StoreError) -> PyErr {
    match err {
        StoreError::NotFound(message) => PyKeyError::new_err(format!("not found: {message}")),
        StoreError::Closed | StoreError::Poisoned => PyRuntimeError::new_err(err.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn py_error<E: std::fmt::Display>(err: E) -> PyErr {
    PyValueError::new_err(err.to_string())
}
