use colloquy_types::{
    Conversation, ConversationConfig, Event, EventKind, Experiment, Message, RunStatus,
    TurnMetrics, TurnMetricsRecord,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::{
    BatchImportReport, EventFilter, EventStore, ExperimentSummary, FlushReport, ImportResult,
    ImportService, StatusUpdate, StoreConfig, StoreError, StoreResult,
};

/// Async front for [`EventStore`]. Each call runs on tokio's blocking pool,
/// at most `worker_threads` at a time.
#[derive(Clone)]
pub struct AsyncEventStore {
    inner: Arc<EventStore>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for AsyncEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventStore")
            .field("inner", &self.inner)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl AsyncEventStore {
    pub fn new(store: EventStore) -> Self {
        let workers = store.config().worker_threads.max(1);
        Self {
            inner: Arc::new(store),
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let store = tokio::task::spawn_blocking(move || EventStore::open(config))
            .await
            .map_err(|err| StoreError::Connection(format!("worker task failed: {err}")))??;
        Ok(Self::new(store))
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.inner
    }

    async fn run<F, T>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&EventStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op(&store)
        })
        .await
        .map_err(|err| StoreError::Connection(format!("worker task failed: {err}")))?
    }

    pub async fn append_event(
        &self,
        kind: EventKind,
        conversation_id: Option<String>,
        experiment_id: Option<String>,
    ) -> StoreResult<i64> {
        self.run(move |store| {
            store.append_event(kind, conversation_id.as_deref(), experiment_id.as_deref())
        })
        .await
    }

    pub async fn create_experiment(&self, name: String, config: Value) -> StoreResult<String> {
        self.run(move |store| store.create_experiment(&name, config))
            .await
    }

    pub async fn create_conversation(
        &self,
        experiment_id: String,
        conversation_id: String,
        config: ConversationConfig,
    ) -> StoreResult<Conversation> {
        self.run(move |store| store.create_conversation(&experiment_id, &conversation_id, config))
            .await
    }

    pub async fn update_conversation_status(
        &self,
        conversation_id: String,
        update: StatusUpdate,
    ) -> StoreResult<Conversation> {
        self.run(move |store| store.update_conversation_status(&conversation_id, update))
            .await
    }

    pub async fn update_experiment_status(
        &self,
        experiment_id: String,
        status: RunStatus,
        error: Option<String>,
    ) -> StoreResult<Experiment> {
        self.run(move |store| store.update_experiment_status(&experiment_id, status, error))
            .await
    }

    pub async fn log_turn_metrics(
        &self,
        conversation_id: String,
        turn_number: u32,
        metrics: TurnMetrics,
    ) -> StoreResult<()> {
        self.run(move |store| store.log_turn_metrics(&conversation_id, turn_number, &metrics))
            .await
    }

    pub async fn log_message(&self, message: Message) -> StoreResult<bool> {
        self.run(move |store| {
            store.log_message(
                &message.conversation_id,
                message.turn_number,
                &message.agent_id,
                &message.content,
                message.token_count,
                message.model.as_deref(),
            )
        })
        .await
    }

    pub async fn get_events(&self, filter: EventFilter) -> StoreResult<Vec<Event>> {
        self.run(move |store| store.get_events(&filter)).await
    }

    pub async fn get_experiment(&self, experiment_id: String) -> StoreResult<Option<Experiment>> {
        self.run(move |store| store.get_experiment(&experiment_id))
            .await
    }

    pub async fn get_conversation(
        &self,
        conversation_id: String,
    ) -> StoreResult<Option<Conversation>> {
        self.run(move |store| store.get_conversation(&conversation_id))
            .await
    }

    pub async fn list_conversations(&self, experiment_id: String) -> StoreResult<Vec<Conversation>> {
        self.run(move |store| store.list_conversations(&experiment_id))
            .await
    }

    pub async fn get_turn_metrics(
        &self,
        conversation_id: String,
    ) -> StoreResult<Vec<TurnMetricsRecord>> {
        self.run(move |store| store.get_turn_metrics(&conversation_id))
            .await
    }

    pub async fn get_messages(&self, conversation_id: String) -> StoreResult<Vec<Message>> {
        self.run(move |store| store.get_messages(&conversation_id))
            .await
    }

    pub async fn experiment_summary(&self, experiment_id: String) -> StoreResult<ExperimentSummary> {
        self.run(move |store| store.experiment_summary(&experiment_id))
            .await
    }

    pub async fn flush(&self) -> StoreResult<FlushReport> {
        self.run(|store| store.flush()).await
    }

    pub async fn import(&self, dir: PathBuf) -> StoreResult<ImportResult> {
        self.run(move |store| Ok(ImportService::new(store).import(&dir)))
            .await
    }

    pub async fn import_all(&self, root: PathBuf) -> StoreResult<BatchImportReport> {
        self.run(move |store| ImportService::new(store).import_all(&root))
            .await
    }

    /// Closes the store on a worker, then refuses further calls.
    pub async fn close(&self) -> StoreResult<()> {
        self.run(|store| store.close()).await?;
        self.permits.close();
        Ok(())
    }

    /// Same as [`close`](Self::close) for callers outside a runtime.
    pub fn close_blocking(&self) -> StoreResult<()> {
        self.inner.close()?;
        self.permits.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::{tags, MessageComplete};
    use serde_json::json;

    #[tokio::test]
    async fn async_calls_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = AsyncEventStore::open(StoreConfig::new(dir.path().join("async.db")))
            .await
            .unwrap();
        let experiment_id = store
            .create_experiment("T".to_string(), json!({"repetitions": 1}))
            .await
            .unwrap();
        store
            .create_conversation(
                experiment_id.clone(),
                "c1".to_string(),
                ConversationConfig::default(),
            )
            .await
            .unwrap();
        for turn in 1..=2 {
            store
                .log_turn_metrics("c1".to_string(), turn, TurnMetrics::default())
                .await
                .unwrap();
        }
        let conversation = store
            .update_conversation_status("c1".to_string(), StatusUpdate::ended("max_turns"))
            .await
            .unwrap();
        assert_eq!(conversation.total_turns, 2);

        store.flush().await.unwrap();
        let events = store
            .get_events(EventFilter::experiment(experiment_id.clone()))
            .await
            .unwrap();
        let kinds: Vec<&str> = events.iter().map(|event| event.event_type()).collect();
        assert_eq!(kinds.len(), 3);
        assert!(kinds.contains(&tags::EXPERIMENT_CREATED));
        assert!(kinds.contains(&tags::CONVERSATION_CREATED));
        assert_eq!(kinds[2], tags::CONVERSATION_STATUS_CHANGED);
        let summary = store.experiment_summary(experiment_id).await.unwrap();
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_keep_sequences_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = AsyncEventStore::open(StoreConfig::new(dir.path().join("async.db")))
            .await
            .unwrap();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_event(
                        EventKind::MessageComplete(MessageComplete {
                            agent_id: "agent_a".to_string(),
                            turn_number: None,
                            tokens: 1,
                        }),
                        Some("c1".to_string()),
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut sequences = Vec::new();
        for handle in handles {
            sequences.push(handle.await.unwrap());
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calls_hold_a_worker_permit_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("async.db")).with_worker_threads(2);
        let store = AsyncEventStore::open(config).await.unwrap();
        assert_eq!(store.permits.available_permits(), 2);

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let busy = store.clone();
        let task = tokio::spawn(async move {
            busy.run(move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
            .await
        });
        tokio::task::spawn_blocking(move || started_rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(store.permits.available_permits(), 1);

        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(store.permits.available_permits(), 2);
    }

    #[test]
    fn blocking_close_refuses_later_async_calls() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = runtime
            .block_on(AsyncEventStore::open(StoreConfig::new(dir.path().join("async.db"))))
            .unwrap();
        store.close_blocking().unwrap();
        assert!(store.store().is_closed());
        assert!(matches!(runtime.block_on(store.flush()), Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn closed_store_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = AsyncEventStore::open(StoreConfig::new(dir.path().join("async.db")))
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get_experiment("e1".to_string()).await,
            Err(StoreError::Closed)
        ));
    }
}
