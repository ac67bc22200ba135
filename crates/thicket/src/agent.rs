/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Agents
//!
//! An agent owns exactly one tree: the root's supervision subtree, a tick
//! scheduler (unless the host drives it manually), an event bus, and its own
//! blackboard namespace. [`Agent::spawn`] compiles a description and brings
//! all of that up; the returned [`AgentHandle`] is the host's view of the
//! running automaton.

use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::ActionRegistry;
use crate::blackboard::{self, BlackboardHandle, StoreHandle};
use crate::config::{self, AgentSpec, Blueprint};
use crate::event::{Event, EventBus, TerminateReason};
use crate::node::{NodeError, NodeHandle};
use crate::supervisor::{self, RestartPolicy};
use crate::tick;
use crate::{Status, ThicketResult};

/// Identifies one agent in a population. Cheap to clone; carried on every
/// event and blackboard change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentId(Arc<str>);

impl AgentId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ambient state every task belonging to one agent hangs on to.
pub(crate) struct AgentShared {
    pub id: AgentId,
    pub events: EventBus,
    pub blackboard: BlackboardHandle,
    pub tick_counter: AtomicU64,
    /// Consecutive action handler errors; reset by any successful handler
    /// tick, fatal at `handler_error_cap`.
    pub handler_errors: AtomicU32,
    pub handler_error_cap: u32,
    pub restart_policy: RestartPolicy,
    pub tick_deadline: Duration,
    pub cancel: CancellationToken,
}

pub struct Agent;

impl Agent {
    /// Compile `spec` against `registry` and bring the tree up. Validation
    /// failures are fatal here; a running agent never sees them.
    pub async fn spawn(spec: AgentSpec, registry: &ActionRegistry) -> ThicketResult<AgentHandle> {
        spawn_with(spec, registry, None).await
    }
}

pub(crate) async fn spawn_with(
    spec: AgentSpec,
    registry: &ActionRegistry,
    shared_store: Option<StoreHandle>,
) -> ThicketResult<AgentHandle> {
    let blueprint = config::compile(&spec, registry)?;
    let id = AgentId::new(&spec.id);
    let blackboard = BlackboardHandle::new(id.clone(), blackboard::spawn_store(), shared_store);

    let shared = Arc::new(AgentShared {
        id: id.clone(),
        events: EventBus::new(128),
        blackboard,
        tick_counter: AtomicU64::new(0),
        handler_errors: AtomicU32::new(0),
        handler_error_cap: spec.max_handler_errors,
        restart_policy: RestartPolicy {
            max_restarts: spec.max_restarts,
            window: Duration::from_secs(spec.max_restart_window_s),
        },
        tick_deadline: Duration::from_millis(spec.tick_deadline_ms),
        cancel: CancellationToken::new(),
    });

    let root = supervisor::spawn_node(blueprint.root.clone(), shared.clone());
    log::debug!("agent {id} started ({} nodes)", blueprint.node_count);
    shared.events.emit(Event::AgentStarted { agent: id.clone() });

    let scheduler = spec
        .tick_freq()
        .map(|period| tokio::spawn(tick::run_scheduler(root.clone(), shared.clone(), period)));

    Ok(AgentHandle {
        id,
        root,
        shared,
        blueprint,
        scheduler,
        shutdown_timeout: Duration::from_millis(spec.shutdown_timeout_ms),
    })
}

/// The host's view of a running agent.
pub struct AgentHandle {
    id: AgentId,
    root: NodeHandle,
    shared: Arc<AgentShared>,
    blueprint: Blueprint,
    scheduler: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl AgentHandle {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Subscribe to the agent's observability events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// This agent's view of the blackboard.
    pub fn blackboard(&self) -> BlackboardHandle {
        self.shared.blackboard.clone()
    }

    /// Deliver one tick to the root and wait for the resulting status. Hosts
    /// that spawned the agent with a tick period normally never call this;
    /// agents built with [`AgentSpec::manual`] are driven entirely through
    /// it.
    pub async fn tick(&self) -> Result<Status, NodeError> {
        tick::drive_tick(&self.root, &self.shared).await
    }

    /// The root's current status, without ticking.
    pub async fn status(&self) -> Result<Status, NodeError> {
        self.root.status().await
    }

    /// Abort the whole tree. Once this returns, every node below the root
    /// has terminated `Aborted` exactly once.
    pub async fn abort(&self) -> Result<(), NodeError> {
        self.root.abort().await
    }

    /// Return the tree to fresh so the next tick starts a new run.
    pub async fn reset(&self) -> Result<(), NodeError> {
        self.root.reset().await
    }

    pub(crate) fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Terminate the agent: abort the tree depth-first under the shutdown
    /// grace period, then cancel every task belonging to it.
    pub async fn shutdown(self) {
        if !self.shared.cancel.is_cancelled() {
            if tokio::time::timeout(self.shutdown_timeout, self.root.abort())
                .await
                .is_err()
            {
                log::warn!("agent {} did not abort within the grace period", self.id);
            }
            self.shared.events.emit(Event::AgentTerminated {
                agent: self.id.clone(),
                reason: TerminateReason::Shutdown,
            });
            self.shared.cancel.cancel();
        }
        if let Some(scheduler) = self.scheduler {
            let _ = scheduler.await;
        }
        log::debug!("agent {} terminated", self.id);
    }
}
