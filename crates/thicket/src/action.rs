/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Action handlers
//!
//! Leaves are the only place domain work happens. The host implements
//! [`ActionHandler`] and registers a named factory for it in an
//! [`ActionRegistry`]; tree descriptions refer to handlers by that name.
//!
//! Handlers must cooperate with the tick protocol: return
//! [`Status::Running`](crate::Status::Running) instead of blocking past the
//! tick deadline, never hold locks across an await, and never call back into
//! the tree. The blackboard on the [`TickCtx`] is the one sanctioned way to
//! affect the rest of the tree.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::agent::AgentId;
use crate::blackboard::BlackboardHandle;
use crate::{Status, ThicketResult};

/// The free-form parameter map a tree description attaches to a node.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Per-tick context handed to every node. Transient: nothing here survives
/// the tick.
#[derive(Debug, Clone)]
pub struct TickCtx {
    pub agent_id: AgentId,
    /// Monotonic tick counter, starting at 1 for the first tick.
    pub tick: u64,
    /// The whole call chain below the root must resolve by this instant.
    pub deadline: Instant,
    pub blackboard: BlackboardHandle,
}

/// An error escaping an action handler. Converted to
/// [`Status::Failure`](crate::Status::Failure) at the node boundary; too many
/// in a row shut the agent down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("HandlerError: {0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// User-supplied behavior for an action leaf.
///
/// Lifecycle: `on_init` once per entry from fresh, `on_tick` once per tick
/// until it returns a terminal status, `on_terminate` exactly once with that
/// status (or `Aborted` if the tree cancels the action first).
#[async_trait]
pub trait ActionHandler: Send {
    /// Called when the node enters from fresh, before the first `on_tick` of
    /// the run. Not called again on `Running` re-entry.
    async fn on_init(&mut self, _ctx: &TickCtx) -> Result<(), HandlerError> {
        Ok(())
    }

    /// One step of work. Return `Running` to be ticked again.
    async fn on_tick(&mut self, ctx: &TickCtx) -> Result<Status, HandlerError>;

    /// Called once the run reaches a terminal status. Release resources here.
    async fn on_terminate(&mut self, _final_status: Status) {}
}

/// Lift a closure into an [`ActionHandler`]. Mostly useful for tests and
/// small demo agents.
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F>
where
    F: FnMut(&TickCtx) -> Status + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ActionHandler for FnAction<F>
where
    F: FnMut(&TickCtx) -> Status + Send,
{
    async fn on_tick(&mut self, ctx: &TickCtx) -> Result<Status, HandlerError> {
        Ok((self.f)(ctx))
    }
}

/// Builds a fresh handler instance from a node's parameter map. Invoked once
/// at agent start for validation and again whenever a supervisor replaces a
/// crashed action worker.
pub type ActionFactory =
    Arc<dyn Fn(&Parameters) -> ThicketResult<Box<dyn ActionHandler>> + Send + Sync>;

/// Maps handler names, as they appear in tree descriptions, to factories.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: ahash::HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous registration.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&Parameters) -> ThicketResult<Box<dyn ActionHandler>> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub(crate) fn factory(&self, name: &str) -> Option<ActionFactory> {
        self.factories.get(name).cloned()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
