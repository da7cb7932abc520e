//! The engine: creates, loads and addresses conversations

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weft_ai::ModelAdapter;

use crate::condenser::{Condenser, LlmSummarizer, Summarizer};
use crate::config::{ConversationConfig, EngineConfig};
use crate::conversation::{self, ConversationTask, Runtime};
use crate::error::Result;
use crate::event::{ConversationId, Event, Seq};
use crate::handle::ConversationHandle;
use crate::log::EventLog;
use crate::notifier::{EventStream, Notifier, WebhookHandle};
use crate::registry::ToolRegistry;
use crate::state::ConversationState;
use crate::step::AgentStep;
use crate::store::{ConversationMeta, LogStore};
use crate::stuck::StuckDetector;

const COMMAND_QUEUE_SIZE: usize = 64;

/// Runs any number of conversations over a shared tool registry, model
/// adapter and log store.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    adapter: Arc<dyn ModelAdapter>,
    summarizer: Arc<dyn Summarizer>,
    store: Arc<dyn LogStore>,
    notifier: Notifier,
    conversations: Mutex<HashMap<ConversationId, ConversationHandle>>,
    /// Serializes loading from the store so recovery runs once per log
    loading: Mutex<()>,
    webhooks: Mutex<Vec<WebhookHandle>>,
}

impl Engine {
    /// Create an engine. Fails on an invalid configuration. Webhook delivery
    /// starts immediately, so this must be called inside a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        registry: Arc<ToolRegistry>,
        adapter: Arc<dyn ModelAdapter>,
        store: Arc<dyn LogStore>,
    ) -> Result<Self> {
        config.validate()?;
        let notifier = Notifier::new(config.notifier.channel_capacity);
        let webhooks = notifier.spawn_webhooks(&config.notifier.webhooks);
        let summarizer: Arc<dyn Summarizer> = Arc::new(LlmSummarizer::new(Arc::clone(&adapter)));
        tracing::info!(
            tools = registry.len(),
            webhooks = webhooks.len(),
            "Engine started"
        );
        Ok(Self {
            config,
            registry,
            adapter,
            summarizer,
            store,
            notifier,
            conversations: Mutex::new(HashMap::new()),
            loading: Mutex::new(()),
            webhooks: Mutex::new(webhooks),
        })
    }

    /// Use a different summarizer for condensation
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Start a new, empty conversation
    pub fn create(&self, config: ConversationConfig) -> Result<ConversationId> {
        // Reject bad overrides before anything is stored
        self.config.resolve(&config)?;
        let meta = ConversationMeta::new(uuid::Uuid::new_v4(), config);
        self.store.create(&meta)?;
        let log = EventLog::new(meta.id, Arc::clone(&self.store));
        let handle = self.spawn(log, &meta.config)?;
        self.insert(meta.id, handle);
        tracing::info!(conversation = %meta.id, "Conversation created");
        Ok(meta.id)
    }

    /// Load a stored conversation, or return it if it is already loaded.
    ///
    /// The log is checked for integrity and derived state is rebuilt by
    /// folding it. An action that was running when the previous process
    /// stopped is recorded as interrupted.
    pub fn open(&self, id: ConversationId) -> Result<ConversationHandle> {
        if let Some(handle) = self.conversations.lock().get(&id) {
            return Ok(handle.clone());
        }

        // Disk reads happen outside the map lock; lookups of loaded
        // conversations never wait on them
        let _loading = self.loading.lock();
        if let Some(handle) = self.conversations.lock().get(&id) {
            return Ok(handle.clone());
        }
        let stored = self.store.load(id)?;
        let mut log = EventLog::from_events(id, stored.events, Arc::clone(&self.store))?;
        conversation::recover(&mut log)?;
        let handle = self.spawn(log, &stored.meta.config)?;
        self.insert(id, handle.clone());
        tracing::info!(conversation = %id, "Conversation opened");
        Ok(handle)
    }

    /// Track a live conversation, releasing those that have finished.
    ///
    /// A released conversation's task stops once every outside handle to it
    /// is dropped; opening it again reloads it from the store.
    fn insert(&self, id: ConversationId, handle: ConversationHandle) {
        let mut conversations = self.conversations.lock();
        let before = conversations.len();
        conversations.retain(|_, handle| !handle.status().is_terminal());
        if conversations.len() < before {
            tracing::debug!("Released {} finished conversation(s)", before - conversations.len());
        }
        conversations.insert(id, handle);
    }

    /// Ids of conversations currently held in memory
    pub fn loaded(&self) -> Vec<ConversationId> {
        self.conversations.lock().keys().copied().collect()
    }

    /// Handle to a conversation, loading it if needed
    pub fn conversation(&self, id: ConversationId) -> Result<ConversationHandle> {
        self.open(id)
    }

    fn spawn(&self, log: EventLog, overrides: &ConversationConfig) -> Result<ConversationHandle> {
        let resolved = self.config.resolve(overrides)?;
        let condenser = Condenser::new(resolved.condenser, Arc::clone(&self.summarizer))?;
        let step = AgentStep::new(Arc::clone(&self.adapter), self.config.retry_config())
            .with_system_prompt(resolved.system_prompt);
        let runtime = Runtime {
            registry: Arc::clone(&self.registry),
            step,
            condenser,
            gate: resolved.gate,
            stuck: self.config.stuck_threshold.map(StuckDetector::new),
            max_iterations: resolved.max_iterations_per_run,
            cancel_grace: self.config.cancel_grace(),
            notifier: self.notifier.clone(),
        };

        let id = log.conversation_id();
        let log = Arc::new(RwLock::new(log));
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let cancel = CancellationToken::new();
        let (task, state) =
            ConversationTask::new(Arc::clone(&log), receiver, cancel.clone(), runtime);
        tokio::spawn(task.run());

        Ok(ConversationHandle {
            id,
            commands,
            cancel,
            state,
            log,
            notifier: self.notifier.clone(),
        })
    }

    /// Ids of every stored conversation
    pub fn list(&self) -> Result<Vec<ConversationId>> {
        self.store.list()
    }

    pub async fn send_message(&self, id: ConversationId, text: impl Into<String>) -> Result<Seq> {
        self.conversation(id)?.send_message(text).await
    }

    pub async fn run(&self, id: ConversationId) -> Result<()> {
        self.conversation(id)?.run().await
    }

    pub async fn pause(&self, id: ConversationId) -> Result<()> {
        self.conversation(id)?.pause().await
    }

    pub async fn resume(&self, id: ConversationId) -> Result<()> {
        self.conversation(id)?.resume().await
    }

    pub async fn cancel(&self, id: ConversationId) -> Result<()> {
        self.conversation(id)?.cancel().await
    }

    pub async fn approve(&self, id: ConversationId, action: Seq) -> Result<()> {
        self.conversation(id)?.approve(action).await
    }

    pub async fn reject(
        &self,
        id: ConversationId,
        action: Seq,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.conversation(id)?.reject(action, reason).await
    }

    pub fn state(&self, id: ConversationId) -> Result<ConversationState> {
        Ok(self.conversation(id)?.state())
    }

    pub fn events(&self, id: ConversationId) -> Result<Vec<Event>> {
        Ok(self.conversation(id)?.events())
    }

    pub fn events_since(&self, id: ConversationId, from: Seq) -> Result<EventStream> {
        Ok(self.conversation(id)?.events_since(from))
    }

    pub async fn wait_for_idle(&self, id: ConversationId) -> Result<ConversationState> {
        Ok(self.conversation(id)?.wait_for_idle().await)
    }

    /// Stop a conversation's task and remove its log
    pub async fn delete(&self, id: ConversationId) -> Result<()> {
        let handle = self.conversations.lock().remove(&id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.shutdown().await;
        }
        self.store.delete(id)?;
        tracing::info!(conversation = %id, "Conversation deleted");
        Ok(())
    }

    /// Stop every conversation task, then flush webhooks.
    ///
    /// Committed events are already durable; a conversation that was running
    /// resumes from its log the next time it is opened.
    pub async fn shutdown(&self) {
        let handles: Vec<ConversationHandle> = self
            .conversations
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.shutdown().await;
        }

        let webhooks: Vec<WebhookHandle> = self.webhooks.lock().drain(..).collect();
        for webhook in webhooks {
            webhook.shutdown().await;
        }
        tracing::info!("Engine stopped");
    }
}
