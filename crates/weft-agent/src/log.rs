//! Append-only event log for one conversation

use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::event::{ConversationId, Event, EventKind, Seq};
use crate::store::LogStore;

/// The ordered events of one conversation, mirrored to a [`LogStore`].
///
/// Only the conversation's own task appends, so sequence numbers are assigned
/// here without further coordination.
pub struct EventLog {
    conversation_id: ConversationId,
    events: Vec<Event>,
    store: Arc<dyn LogStore>,
}

impl EventLog {
    /// Start an empty log. The store must already hold the conversation's metadata.
    pub fn new(conversation_id: ConversationId, store: Arc<dyn LogStore>) -> Self {
        Self {
            conversation_id,
            events: Vec::new(),
            store,
        }
    }

    /// Wrap events read back from storage after checking their integrity
    pub fn from_events(
        conversation_id: ConversationId,
        events: Vec<Event>,
        store: Arc<dyn LogStore>,
    ) -> Result<Self> {
        check_integrity(conversation_id, &events)?;
        Ok(Self {
            conversation_id,
            events,
            store,
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Persist a new event, then make it visible.
    ///
    /// If the store fails nothing is appended and the sequence number is not consumed.
    pub fn append(&mut self, kind: EventKind, parent: Option<Seq>) -> Result<Event> {
        let event = Event {
            seq: self.next_seq(),
            conversation_id: self.conversation_id,
            timestamp: Utc::now(),
            parent,
            kind,
        };
        self.store.append(&event)?;
        tracing::debug!(
            conversation = %self.conversation_id,
            seq = event.seq,
            "Appended {}",
            event.kind.name()
        );
        self.events.push(event.clone());
        Ok(event)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events with `seq >= from`
    pub fn since(&self, from: Seq) -> &[Event] {
        let start = usize::try_from(from)
            .unwrap_or(usize::MAX)
            .min(self.events.len());
        &self.events[start..]
    }

    pub fn get(&self, seq: Seq) -> Option<&Event> {
        usize::try_from(seq).ok().and_then(|i| self.events.get(i))
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn next_seq(&self) -> Seq {
        self.events.len() as Seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Check that events are numbered 0, 1, 2, ... and all belong to one conversation
pub fn check_integrity(conversation_id: ConversationId, events: &[Event]) -> Result<()> {
    for (index, event) in events.iter().enumerate() {
        if event.conversation_id != conversation_id {
            return Err(Error::LogIntegrity {
                conversation_id,
                detail: format!(
                    "event {} belongs to conversation {}",
                    event.seq, event.conversation_id
                ),
            });
        }
        if event.seq != index as Seq {
            return Err(Error::LogIntegrity {
                conversation_id,
                detail: format!("expected seq {} but found {}", index, event.seq),
            });
        }
        if let Some(parent) = event.parent {
            if parent >= event.seq {
                return Err(Error::LogIntegrity {
                    conversation_id,
                    detail: format!("event {} points at later parent {}", event.seq, parent),
                });
            }
        }
    }
    Ok(())
}
