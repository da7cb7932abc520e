//! The per-conversation task: a single writer that turns commands and agent
//! steps into committed events.
//!
//! The task owns the log. Commands arrive on an mpsc channel and are answered
//! over oneshot channels once their events are committed; the derived state is
//! published on a watch channel after every append. While a run is active,
//! queued commands are handled between discrete steps, so a pause never splits
//! a tool execution from its observation.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::condenser::{Condensation, Condenser};
use crate::error::{Error, Result};
use crate::event::{
    ConversationId, ErrorKind, Event, EventKind, FailureKind, FinishReason, ObservationResult,
    Seq, ToolCall,
};
use crate::gate::{ConfirmationGate, Verdict};
use crate::log::EventLog;
use crate::notifier::Notifier;
use crate::registry::ToolRegistry;
use crate::state::{ConversationState, ExecutionStatus, PendingAction};
use crate::step::{AgentStep, StepError, StepOutcome};
use crate::stuck::StuckDetector;
use crate::tool::Action;

/// Requests handled by the conversation task
pub(crate) enum Command {
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<Seq>>,
    },
    Run {
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    Approve {
        action: Seq,
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        action: Seq,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything a conversation task needs besides its log
pub(crate) struct Runtime {
    pub registry: Arc<ToolRegistry>,
    pub step: AgentStep,
    pub condenser: Condenser,
    pub gate: ConfirmationGate,
    pub stuck: Option<StuckDetector>,
    pub max_iterations: usize,
    pub cancel_grace: Duration,
    pub notifier: Notifier,
}

pub(crate) struct ConversationTask {
    id: ConversationId,
    log: Arc<RwLock<EventLog>>,
    /// Fold of the committed log
    state: ConversationState,
    published: watch::Sender<ConversationState>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    runtime: Runtime,
    running: bool,
    iterations: usize,
}

impl ConversationTask {
    pub(crate) fn new(
        log: Arc<RwLock<EventLog>>,
        commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
        runtime: Runtime,
    ) -> (Self, watch::Receiver<ConversationState>) {
        let (id, state) = {
            let log = log.read();
            (log.conversation_id(), ConversationState::fold(log.events()))
        };
        let (published, receiver) = watch::channel(state.clone());
        let task = Self {
            id,
            log,
            state,
            published,
            commands,
            cancel,
            runtime,
            running: false,
            iterations: 0,
        };
        (task, receiver)
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(conversation = %self.id, "Conversation task started");
        loop {
            if self.running {
                loop {
                    match self.commands.try_recv() {
                        Ok(command) => {
                            if self.handle(command).is_break() {
                                return;
                            }
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                if self.running {
                    self.advance().await;
                }
                continue;
            }

            let deadline = self.confirmation_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle(command).is_break() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(deadline.unwrap_or_default()), if deadline.is_some() => {
                    self.confirmation_timed_out();
                }
            }
        }
        tracing::debug!(conversation = %self.id, "Conversation task stopped");
    }

    fn status(&self) -> ExecutionStatus {
        self.state.status
    }

    /// Commit an event, then fold and publish it. A storage failure leaves
    /// the conversation errored in memory; nothing more can be recorded.
    fn append(&mut self, kind: EventKind, parent: Option<Seq>) -> Option<Event> {
        let appended = self.log.write().append(kind, parent);
        match appended {
            Ok(event) => {
                self.state.apply(&event);
                if self.state.status != ExecutionStatus::Idle {
                    self.running = false;
                }
                self.publish();
                self.runtime.notifier.publish(&event);
                Some(event)
            }
            Err(e) => {
                tracing::error!(conversation = %self.id, "Failed to persist event: {}", e);
                self.state.status = ExecutionStatus::Errored;
                self.state.terminal_reason = Some(format!("{}: {}", ErrorKind::Storage, e));
                self.running = false;
                self.publish();
                None
            }
        }
    }

    fn publish(&self) {
        let mut snapshot = self.state.clone();
        if self.running && snapshot.status == ExecutionStatus::Idle {
            snapshot.status = ExecutionStatus::Running;
        }
        self.published.send_replace(snapshot);
    }

    fn start_running(&mut self) {
        if !self.running {
            self.iterations = 0;
        }
        self.running = self.status() == ExecutionStatus::Idle;
        self.publish();
    }

    fn stop_running(&mut self) {
        self.running = false;
        self.publish();
    }

    fn fail(&mut self, kind: ErrorKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::info!(conversation = %self.id, "Conversation errored ({}): {}", kind, detail);
        self.append(EventKind::ConversationError { kind, detail }, None);
    }

    fn finish(&mut self, reason: FinishReason, parent: Option<Seq>) {
        tracing::info!(conversation = %self.id, "Conversation finished: {}", reason);
        self.append(EventKind::ConversationFinished { reason }, parent);
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text));
            }
            Command::Run { reply } => {
                let _ = reply.send(self.start_run());
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel_now());
            }
            Command::Approve { action, reply } => {
                let _ = reply.send(self.approve(action));
            }
            Command::Reject {
                action,
                reason,
                reply,
            } => {
                let _ = reply.send(self.reject(action, reason, false));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn committed<T>(&self, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| Error::InvalidState {
            operation: "record an event",
            status: self.status(),
        })
    }

    fn send_message(&mut self, text: String) -> Result<Seq> {
        if self.status().is_terminal() {
            return Err(Error::InvalidState {
                operation: "send a message",
                status: self.status(),
            });
        }
        let event = self.append(EventKind::UserMessage { text }, None);
        self.committed(event.map(|e| e.seq))
    }

    fn start_run(&mut self) -> Result<()> {
        match self.status() {
            status if status.is_terminal() || status == ExecutionStatus::Paused => {
                Err(Error::InvalidState {
                    operation: "run",
                    status,
                })
            }
            ExecutionStatus::WaitingForConfirmation => {
                // Running past a held action approves it
                let seq = self.state.pending.as_ref().map(|p| p.seq);
                let event = self.append(EventKind::ActionApproved, seq);
                self.committed(event)?;
                self.start_running();
                Ok(())
            }
            _ => {
                tracing::info!(conversation = %self.id, "Run started");
                self.start_running();
                Ok(())
            }
        }
    }

    fn pause(&mut self) -> Result<()> {
        match self.status() {
            ExecutionStatus::Paused => Ok(()),
            status if status.is_terminal() => Err(Error::InvalidState {
                operation: "pause",
                status,
            }),
            _ => {
                let event = self.append(EventKind::ConversationPaused, None);
                self.committed(event)?;
                self.stop_running();
                tracing::info!(conversation = %self.id, "Conversation paused");
                Ok(())
            }
        }
    }

    fn resume(&mut self) -> Result<()> {
        if self.status() != ExecutionStatus::Paused {
            return Err(Error::InvalidState {
                operation: "resume",
                status: self.status(),
            });
        }
        let event = self.append(EventKind::ConversationResumed, None);
        self.committed(event)?;
        tracing::info!(conversation = %self.id, "Conversation resumed");
        if self.status() == ExecutionStatus::Idle && self.state.has_pending_work() {
            self.start_running();
        }
        Ok(())
    }

    fn cancel_now(&mut self) -> Result<()> {
        if self.status().is_terminal() {
            return Ok(());
        }
        self.finish(FinishReason::Cancelled, None);
        self.stop_running();
        Ok(())
    }

    fn awaiting(&self, operation: &'static str, action: Seq) -> Result<PendingAction> {
        if self.status() != ExecutionStatus::WaitingForConfirmation {
            return Err(Error::InvalidState {
                operation,
                status: self.status(),
            });
        }
        match self.state.awaiting_decision() {
            Some(pending) if pending.seq == action => Ok(pending.clone()),
            _ => Err(Error::NoPendingAction(action)),
        }
    }

    fn approve(&mut self, action: Seq) -> Result<()> {
        self.awaiting("approve", action)?;
        let event = self.append(EventKind::ActionApproved, Some(action));
        self.committed(event)?;
        self.start_running();
        Ok(())
    }

    fn reject(&mut self, action: Seq, reason: String, timed_out: bool) -> Result<()> {
        let pending = self.awaiting("reject", action)?;
        let event = self.append(
            EventKind::ActionRejected {
                tool_call_id: pending.call.id,
                tool: pending.call.name,
                reason,
                timed_out,
            },
            Some(action),
        );
        self.committed(event)?;
        self.start_running();
        Ok(())
    }

    /// Time left before the held action is rejected, if a timeout applies
    fn confirmation_deadline(&self) -> Option<Duration> {
        if self.status() != ExecutionStatus::WaitingForConfirmation {
            return None;
        }
        let timeout = self.runtime.gate.timeout()?;
        let pending = self.state.awaiting_decision()?;
        let proposed_at = self.log.read().get(pending.seq)?.timestamp;
        let elapsed = (chrono::Utc::now() - proposed_at).to_std().unwrap_or_default();
        Some(timeout.saturating_sub(elapsed))
    }

    fn confirmation_timed_out(&mut self) {
        let Some(pending) = self.state.awaiting_decision().cloned() else {
            return;
        };
        tracing::info!(
            conversation = %self.id,
            "Confirmation for '{}' timed out",
            pending.call.name
        );
        if let Err(e) = self.reject(pending.seq, "Timeout".into(), true) {
            tracing::warn!(conversation = %self.id, "Could not record timeout: {}", e);
        }
    }

    /// Take one discrete step of the run
    async fn advance(&mut self) {
        if self.status() != ExecutionStatus::Idle {
            self.stop_running();
            return;
        }
        if self.cancel.is_cancelled() {
            self.finish(FinishReason::Cancelled, None);
            return;
        }

        if let Some(pending) = self.state.pending.clone() {
            if pending.approved {
                self.dispatch(pending).await;
            } else {
                self.stop_running();
            }
            return;
        }

        if let Some(call) = self.state.planned.front().cloned() {
            self.propose(call).await;
            return;
        }

        if !self.state.awaiting_agent {
            tracing::info!(conversation = %self.id, "Run complete, nothing left to do");
            self.stop_running();
            return;
        }

        if self.iterations >= self.runtime.max_iterations {
            self.fail(
                ErrorKind::MaxIterations,
                format!("run exceeded {} agent steps", self.runtime.max_iterations),
            );
            return;
        }
        if let Some(detector) = self.runtime.stuck {
            let stuck = detector.is_stuck(self.log.read().events());
            if stuck {
                self.fail(
                    ErrorKind::Stuck,
                    format!(
                        "the same action produced the same result {} times in a row",
                        detector.threshold()
                    ),
                );
                return;
            }
        }

        self.iterations += 1;
        self.agent_turn().await;
    }

    async fn propose(&mut self, call: ToolCall) {
        let (risk, verdict) =
            self.runtime
                .gate
                .classify(&self.runtime.registry, &call.name, &call.arguments);
        let requires_confirmation = verdict == Verdict::NeedsConfirmation;
        tracing::debug!(
            conversation = %self.id,
            "Proposing '{}' (risk {}, {:?})",
            call.name,
            risk,
            verdict
        );
        let proposed = self.append(
            EventKind::ActionProposed {
                tool_call_id: call.id,
                tool: call.name,
                arguments: call.arguments,
                risk,
                requires_confirmation,
            },
            None,
        );
        if proposed.is_none() || requires_confirmation {
            return;
        }
        // Auto-approved actions run in the same step as their proposal
        if let Some(pending) = self.state.pending.clone() {
            self.dispatch(pending).await;
        }
    }

    async fn dispatch(&mut self, pending: PendingAction) {
        let action = Action {
            tool_call_id: pending.call.id.clone(),
            tool_name: pending.call.name.clone(),
            arguments: pending.call.arguments.clone(),
            declared_risk: pending.risk,
        };
        let registry = Arc::clone(&self.runtime.registry);
        let token = self.cancel.child_token();
        let mut task = tokio::spawn(async move { registry.dispatch(action, token).await });

        let (joined, cancelled) = tokio::select! {
            biased;
            joined = &mut task => (joined, false),
            _ = self.cancel.cancelled() => {
                match tokio::time::timeout(self.runtime.cancel_grace, &mut task).await {
                    Ok(joined) => (joined, true),
                    Err(_) => {
                        task.abort();
                        self.fail(
                            ErrorKind::Cancelled,
                            format!(
                                "tool '{}' did not stop within {:?} of cancellation",
                                pending.call.name, self.runtime.cancel_grace
                            ),
                        );
                        return;
                    }
                }
            }
        };

        let result = joined.unwrap_or_else(|e| {
            ObservationResult::failure(FailureKind::Executor, format!("Tool task failed: {}", e))
        });
        tracing::debug!(
            conversation = %self.id,
            "Observed '{}': {}",
            pending.call.name,
            if result.is_success() { "success" } else { "failure" }
        );
        let observed = self.append(
            EventKind::Observation {
                tool_call_id: pending.call.id,
                tool: pending.call.name,
                result,
            },
            Some(pending.seq),
        );
        if cancelled && observed.is_some() {
            self.finish(FinishReason::Cancelled, None);
        }
    }

    async fn condense(&mut self, forced: bool) -> Option<Vec<Event>> {
        let events = self.log.read().events().to_vec();
        let condenser = self.runtime.condenser.clone();
        let condensed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.fail(ErrorKind::Cancelled, "cancelled while condensing history");
                return None;
            }
            condensed = async {
                if forced {
                    condenser.force(&events).await
                } else {
                    condenser.condense(&events).await
                }
            } => condensed,
        };

        match condensed {
            Ok(Condensation { view, summary }) => {
                if let Some(summary) = summary {
                    tracing::debug!(
                        conversation = %self.id,
                        "Summarized events {}..={}",
                        summary.first_seq,
                        summary.last_seq
                    );
                    self.append(summary.into_kind(), None)?;
                }
                Some(view)
            }
            Err(e) => {
                self.fail(ErrorKind::ProviderFailure, e.to_string());
                None
            }
        }
    }

    async fn agent_turn(&mut self) {
        let Some(mut view) = self.condense(false).await else {
            return;
        };
        let mut recondensed = false;

        let outcome = loop {
            let tools = self.runtime.registry.schemas();
            let result = self.runtime.step.run(&view, tools, &self.cancel).await;
            match result {
                Err(StepError::ContextOverflow(message)) if !recondensed => {
                    tracing::warn!(
                        conversation = %self.id,
                        "Context overflow ({}), forcing condensation",
                        message
                    );
                    recondensed = true;
                    match self.condense(true).await {
                        Some(forced) => view = forced,
                        None => return,
                    }
                }
                other => break other,
            }
        };

        match outcome {
            Ok((StepOutcome::Final { text }, usage)) => {
                tracing::debug!(conversation = %self.id, "Final message ({} output tokens)", usage.output);
                let message = self.append(
                    EventKind::AgentMessage {
                        text,
                        tool_calls: Vec::new(),
                    },
                    None,
                );
                if let Some(message) = message {
                    self.finish(FinishReason::AgentFinished, Some(message.seq));
                }
            }
            Ok((StepOutcome::Actions { text, calls }, usage)) => {
                tracing::debug!(
                    conversation = %self.id,
                    "Agent proposed {} action(s) ({} output tokens)",
                    calls.len(),
                    usage.output
                );
                self.append(
                    EventKind::AgentMessage {
                        text,
                        tool_calls: calls,
                    },
                    None,
                );
            }
            Err(StepError::Cancelled) => {
                self.fail(ErrorKind::Cancelled, "model call cancelled");
            }
            Err(e @ StepError::ContextOverflow(_)) | Err(e @ StepError::ProviderFailure { .. }) => {
                self.fail(ErrorKind::ProviderFailure, e.to_string());
            }
        }
    }
}

/// Record actions that were running when the process stopped.
///
/// An approved action with no observation was interrupted mid-dispatch; it is
/// answered with an `interrupted` failure instead of being run again.
pub(crate) fn recover(log: &mut EventLog) -> Result<Option<Event>> {
    let state = ConversationState::fold(log.events());
    if state.status.is_terminal() {
        return Ok(None);
    }
    let Some(pending) = state.pending.filter(|p| p.approved) else {
        return Ok(None);
    };
    tracing::warn!(
        conversation = %log.conversation_id(),
        "Action '{}' was interrupted, recording it as failed",
        pending.call.name
    );
    let event = log.append(
        EventKind::Observation {
            tool_call_id: pending.call.id,
            tool: pending.call.name,
            result: ObservationResult::failure(
                FailureKind::Interrupted,
                "the process stopped before the action completed",
            ),
        },
        Some(pending.seq),
    )?;
    Ok(Some(event))
}
