//! A cloneable handle for driving one conversation from external code.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::conversation::Command;
use crate::error::{Error, Result};
use crate::event::{ConversationId, Event, Seq};
use crate::log::EventLog;
use crate::notifier::{self, EventStream, Notifier};
use crate::state::{ConversationState, ExecutionStatus};

/// A cloneable handle to a running conversation task.
///
/// Every mutation is a command answered by the task once the corresponding
/// events are committed. Cloning is cheap.
#[derive(Clone)]
pub struct ConversationHandle {
    pub(crate) id: ConversationId,
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Receiver<ConversationState>,
    pub(crate) log: Arc<RwLock<EventLog>>,
    pub(crate) notifier: Notifier,
}

impl ConversationHandle {
    pub fn id(&self) -> ConversationId {
        self.id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Append a user message; returns its sequence number
    pub async fn send_message(&self, text: impl Into<String>) -> Result<Seq> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply }).await
    }

    /// Start stepping. Returns once the run has started; see [`Self::wait_for_idle`].
    pub async fn run(&self) -> Result<()> {
        self.request(|reply| Command::Run { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Cancel in-flight work and end the conversation
    pub async fn cancel(&self) -> Result<()> {
        // Interrupt the model call or tool before queueing behind it
        self.cancel.cancel();
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Approve the action proposed at `action`
    pub async fn approve(&self, action: Seq) -> Result<()> {
        self.request(|reply| Command::Approve { action, reply }).await
    }

    /// Reject the action proposed at `action`
    pub async fn reject(&self, action: Seq, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| Command::Reject {
            action,
            reason,
            reply,
        })
        .await
    }

    /// Snapshot of the derived state
    pub fn state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.borrow().status
    }

    /// Wait until the conversation stops running.
    pub async fn wait_for_idle(&self) -> ConversationState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|s| s.status != ExecutionStatus::Running)
            .await
            .map(|s| (*s).clone());
        match result {
            Ok(snapshot) => snapshot,
            // The task stopped; report its last state
            Err(_) => state.borrow().clone(),
        }
    }

    /// Wait until the conversation stops running, with a timeout.
    /// Returns `None` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: Duration) -> Option<ConversationState> {
        tokio::time::timeout(timeout, self.wait_for_idle()).await.ok()
    }

    /// All committed events
    pub fn events(&self) -> Vec<Event> {
        self.log.read().events().to_vec()
    }

    /// Committed events from `from` onward, followed by live ones
    pub fn events_since(&self, from: Seq) -> EventStream {
        let receiver = self.notifier.subscribe();
        notifier::events_since(self.log.clone(), receiver, self.id, from)
    }

    /// Stop the conversation task. Committed events stay in the store.
    pub(crate) async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = response.await;
        }
    }
}
