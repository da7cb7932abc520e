//! Event fan-out: live subscriptions and webhook delivery

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{ConversationId, Event, Seq};
use crate::log::EventLog;

/// Stream of a conversation's events in sequence order
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Broadcasts every committed event to subscribers.
///
/// Delivery is lossy for slow receivers; the event log stays authoritative and
/// [`events_since`] re-reads it whenever a receiver falls behind.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Event>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a committed event. Having no subscribers is fine.
    pub fn publish(&self, event: &Event) {
        let _ = self.sender.send(event.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Start one delivery task per configured webhook
    pub fn spawn_webhooks(&self, configs: &[WebhookConfig]) -> Vec<WebhookHandle> {
        configs
            .iter()
            .map(|config| {
                let sink = Arc::new(HttpWebhook::new(config));
                spawn_webhook(config.clone(), sink, self.subscribe())
            })
            .collect()
    }
}

/// Stream a conversation's events from `from` onward, then follow live events.
///
/// `receiver` must be subscribed before this is called so nothing committed
/// after the backfill is missed. The stream ends after a terminal event or
/// once the notifier is dropped.
pub fn events_since(
    log: Arc<RwLock<EventLog>>,
    mut receiver: broadcast::Receiver<Event>,
    conversation_id: ConversationId,
    from: Seq,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut next = from;
        let mut closed = false;
        loop {
            let (backlog, ended) = {
                let log = log.read();
                let ended = log.last().is_some_and(Event::is_terminal);
                (log.since(next).to_vec(), ended)
            };
            for event in backlog {
                next = event.seq + 1;
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
            if ended || closed {
                return;
            }

            // Live events only signal that the log grew
            loop {
                match receiver.recv().await {
                    Ok(event) if event.conversation_id != conversation_id || event.seq < next => {}
                    Ok(_) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            conversation = %conversation_id,
                            "Subscriber lagged by {} events, re-reading log",
                            skipped
                        );
                        break;
                    }
                    Err(RecvError::Closed) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
    })
}

fn default_event_buffer_size() -> usize {
    10
}

fn default_flush_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_buffer() -> usize {
    1_000
}

/// A webhook that receives batches of events as JSON arrays via POST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Events buffered before a flush
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    /// Flush a partial buffer after this long without new events
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
    /// Retries after a failed delivery
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each one after
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Undelivered events kept; the oldest are dropped beyond this
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            event_buffer_size: default_event_buffer_size(),
            flush_delay_ms: default_flush_delay_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_buffer: default_max_buffer(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Config("webhook url must not be empty".into()));
        }
        if self.event_buffer_size == 0 || self.flush_delay_ms == 0 {
            return Err(Error::Config(format!(
                "webhook {}: event_buffer_size and flush_delay_ms must be positive",
                self.url
            )));
        }
        if self.max_buffer < self.event_buffer_size {
            return Err(Error::Config(format!(
                "webhook {}: max_buffer must be at least event_buffer_size",
                self.url
            )));
        }
        Ok(())
    }
}

/// Destination for batches of events
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, events: &[Event]) -> std::result::Result<(), String>;
}

/// Posts batches to an HTTP endpoint
pub struct HttpWebhook {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpWebhook {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            headers: config.headers.clone(),
        }
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn deliver(&self, events: &[Event]) -> std::result::Result<(), String> {
        let mut request = self.client.post(&self.url).json(events);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, body));
        }
        Ok(())
    }
}

/// A running webhook delivery task
pub struct WebhookHandle {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl WebhookHandle {
    /// Flush what is buffered and stop
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Webhook task ended abnormally: {}", e);
        }
    }
}

/// Start delivering events from `receiver` to `sink`
pub fn spawn_webhook(
    config: WebhookConfig,
    sink: Arc<dyn WebhookSink>,
    receiver: broadcast::Receiver<Event>,
) -> WebhookHandle {
    let stop = CancellationToken::new();
    let worker = WebhookWorker {
        buffer: VecDeque::new(),
        config,
        sink,
    };
    let task = tokio::spawn(worker.run(receiver, stop.clone()));
    WebhookHandle { task, stop }
}

struct WebhookWorker {
    config: WebhookConfig,
    sink: Arc<dyn WebhookSink>,
    buffer: VecDeque<Event>,
}

impl WebhookWorker {
    async fn run(mut self, mut receiver: broadcast::Receiver<Event>, stop: CancellationToken) {
        let flush_delay = Duration::from_millis(self.config.flush_delay_ms);
        let mut deadline = Instant::now() + flush_delay;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    self.flush().await;
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        self.push(event);
                        deadline = Instant::now() + flush_delay;
                        if self.buffer.len() >= self.config.event_buffer_size {
                            self.flush().await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            url = %self.config.url,
                            "Webhook fell behind, {} events not delivered",
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => {
                        self.flush().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if !self.buffer.is_empty() => {
                    self.flush().await;
                    deadline = Instant::now() + flush_delay;
                }
            }
        }
    }

    fn push(&mut self, event: Event) {
        self.buffer.push_back(event);
        if self.buffer.len() > self.config.max_buffer {
            self.buffer.pop_front();
            tracing::warn!(
                url = %self.config.url,
                "Webhook buffer full ({} events), dropping oldest",
                self.config.max_buffer
            );
        }
    }

    /// Deliver buffered events in batches. A batch that still fails after all
    /// retries stays at the front of the buffer for the next flush.
    async fn flush(&mut self) {
        while !self.buffer.is_empty() {
            let size = self.buffer.len().min(self.config.event_buffer_size);
            let batch: Vec<Event> = self.buffer.iter().take(size).cloned().collect();
            if !self.deliver(&batch).await {
                return;
            }
            self.buffer.drain(..size);
        }
    }

    async fn deliver(&self, batch: &[Event]) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.sink.deliver(batch).await {
                Ok(()) => {
                    tracing::debug!(url = %self.config.url, "Delivered {} events", batch.len());
                    return true;
                }
                Err(e) if attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(
                        self.config
                            .retry_delay_ms
                            .saturating_mul(1u64 << attempt.min(16)),
                    );
                    tracing::warn!(
                        url = %self.config.url,
                        "Webhook delivery failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        self.config.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        url = %self.config.url,
                        "Webhook delivery failed after {} attempts: {}",
                        attempt + 1,
                        e
                    );
                    return false;
                }
            }
        }
    }
}
