//! # Observability events
//!
//! Emitted at tree and supervisor boundaries on a per-agent broadcast bus.
//! Subscribers get every event emitted after they subscribed and filter by
//! [`EventKind`]; a slow subscriber loses old events rather than blocking the
//! tree.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::agent::AgentId;
use crate::node::NodeId;

/// Why an agent stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// Host asked for a graceful shutdown
    Shutdown,
    /// The root supervisor escalated past its restart budget
    Escalated,
    /// Too many consecutive action handler errors
    HandlerErrors(u32),
}

#[derive(Debug, Clone)]
pub enum Event {
    AgentStarted {
        agent: AgentId,
    },
    AgentTerminated {
        agent: AgentId,
        reason: TerminateReason,
    },
    /// A node's worker crashed and was replaced by its supervisor.
    NodeRestarted {
        agent: AgentId,
        node: NodeId,
        reason: String,
    },
    /// A whole subtree was rebuilt after its supervisor escalated.
    NodeRebuilt {
        agent: AgentId,
        node: NodeId,
    },
    TickDeadlineExceeded {
        agent: AgentId,
        node: NodeId,
        elapsed: Duration,
    },
    HandlerError {
        agent: AgentId,
        node: NodeId,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStarted,
    AgentTerminated,
    NodeRestarted,
    NodeRebuilt,
    TickDeadlineExceeded,
    HandlerError,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AgentStarted { .. } => EventKind::AgentStarted,
            Event::AgentTerminated { .. } => EventKind::AgentTerminated,
            Event::NodeRestarted { .. } => EventKind::NodeRestarted,
            Event::NodeRebuilt { .. } => EventKind::NodeRebuilt,
            Event::TickDeadlineExceeded { .. } => EventKind::TickDeadlineExceeded,
            Event::HandlerError { .. } => EventKind::HandlerError,
        }
    }

    pub fn agent(&self) -> &AgentId {
        match self {
            Event::AgentStarted { agent }
            | Event::AgentTerminated { agent, .. }
            | Event::NodeRestarted { agent, .. }
            | Event::NodeRebuilt { agent, .. }
            | Event::TickDeadlineExceeded { agent, .. }
            | Event::HandlerError { agent, .. } => agent,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire and forget; an event with no listeners is not an error.
    pub(crate) fn emit(&self, event: Event) {
        log::debug!("event: {event:?}");
        let _ = self.tx.send(event);
    }
}
