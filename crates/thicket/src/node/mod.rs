/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Node runtime
//!
//! Every node in a running tree is a worker task owning a [`NodeBehavior`]
//! and a mailbox, fronted by a supervisor (see
//! [`supervisor`](crate::supervisor)). Parents drive children exclusively
//! through [`NodeHandle`]s: a tick is a request/reply exchange bounded by the
//! per-tick deadline, an abort is a one-way cancellation that cascades
//! depth-first.
//!
//! The worker owns the lifecycle shared by every node kind: `on_init` exactly
//! once per fresh entry, `update` once per tick, `on_terminate` exactly once
//! per non-terminal to terminal transition, and the implicit re-entry reset
//! that lets a finished node run again on a later tick.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::action::{ActionHandler, HandlerError, TickCtx};
use crate::agent::AgentShared;
use crate::event::Event;
use crate::supervisor::WorkerReport;
use crate::Status;

pub mod composite;
pub mod decorator;

/// Identifies a node within one agent's tree. Assigned in depth-first
/// preorder when the description is compiled, so the root is always id 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for NodeId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

/// Errors crossing a tick boundary. Everything recoverable inside a node is
/// already a [`Status`] by the time it reaches the parent; these are the
/// conditions of the channel itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("NodeError: Node {0:?} is not part of a running tree")]
    NotInitialized(NodeId),

    #[error("NodeError: Node {0:?} is unavailable until its subtree is rebuilt")]
    ChildUnavailable(NodeId),

    #[error("NodeError: Node {0:?} crashed mid-tick and is being restarted")]
    NodeCrash(NodeId),

    #[error("NodeError: Node {0:?} did not reply before the tick deadline")]
    ChildTimeout(NodeId),
}

pub(crate) enum NodeMsg {
    Tick {
        ctx: TickCtx,
        reply: oneshot::Sender<Status>,
    },
    Abort {
        /// `None` when the caller has already given up on this node (deadline
        /// expiry) and must not block on the acknowledgement.
        reply: Option<oneshot::Sender<()>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
}

/// The parent-facing side of a node. Points at the node's supervisor mailbox,
/// so it stays valid across worker restarts.
#[derive(Debug, Clone)]
pub(crate) struct NodeHandle {
    id: NodeId,
    tx: mpsc::Sender<NodeMsg>,
}

impl NodeHandle {
    pub(crate) fn new(id: NodeId, tx: mpsc::Sender<NodeMsg>) -> Self {
        Self { id, tx }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    /// Tick the node and wait for its status, bounded by `ctx.deadline`. On
    /// deadline expiry the node is aborted without waiting for it to comply.
    pub(crate) async fn tick(&self, ctx: TickCtx) -> Result<Status, NodeError> {
        let deadline = ctx.deadline;
        let (reply, rx) = oneshot::channel();
        match tokio::time::timeout_at(deadline, self.tx.send(NodeMsg::Tick { ctx, reply })).await {
            Err(_) => {
                self.abort_detached();
                return Err(NodeError::ChildTimeout(self.id));
            }
            Ok(Err(_)) => return Err(NodeError::ChildUnavailable(self.id)),
            Ok(Ok(())) => {}
        }
        match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => {
                self.abort_detached();
                Err(NodeError::ChildTimeout(self.id))
            }
            Ok(Err(_)) => Err(NodeError::NodeCrash(self.id)),
            Ok(Ok(status)) => Ok(status),
        }
    }

    /// Abort the node and everything below it. Once this returns, every
    /// descendant has run its termination hook.
    pub(crate) async fn abort(&self) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMsg::Abort { reply: Some(reply) })
            .await
            .map_err(|_| NodeError::ChildUnavailable(self.id))?;
        rx.await.map_err(|_| NodeError::NodeCrash(self.id))
    }

    /// Best-effort abort for callers that must not wait (the node already
    /// missed its deadline, so its mailbox may drain late).
    pub(crate) fn abort_detached(&self) {
        let _ = self.tx.try_send(NodeMsg::Abort { reply: None });
    }

    /// Return the node to fresh, discarding its transient run state.
    pub(crate) async fn reset(&self) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMsg::Reset { reply })
            .await
            .map_err(|_| NodeError::ChildUnavailable(self.id))?;
        rx.await.map_err(|_| NodeError::NodeCrash(self.id))
    }

    pub(crate) async fn status(&self) -> Result<Status, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMsg::Status { reply })
            .await
            .map_err(|_| NodeError::ChildUnavailable(self.id))?;
        rx.await.map_err(|_| NodeError::NodeCrash(self.id))
    }
}

/// Ordered child handles of a composite (or the single child of a
/// decorator). The supervisor owns the table and swaps entries when it
/// rebuilds a crashed subtree; workers read it on every access.
pub(crate) type ChildTable = Arc<parking_lot::Mutex<Vec<NodeHandle>>>;

pub(crate) fn child_at(children: &ChildTable, index: usize) -> NodeHandle {
    children.lock()[index].clone()
}

pub(crate) fn child_count(children: &ChildTable) -> usize {
    children.lock().len()
}

/// Tick one child and fold channel-level failures into the status algebra:
/// a missed deadline or a mid-tick crash is a `Failure` here and an event or
/// a rebuild request on the side.
pub(crate) async fn tick_child(
    child: &NodeHandle,
    index: usize,
    ctx: &TickCtx,
    shared: &AgentShared,
    report: &mpsc::UnboundedSender<WorkerReport>,
) -> Status {
    match child.tick(ctx.clone()).await {
        Ok(status) => status,
        Err(NodeError::ChildTimeout(id)) => {
            shared.events.emit(Event::TickDeadlineExceeded {
                agent: shared.id.clone(),
                node: id,
                elapsed: shared.tick_deadline,
            });
            Status::Failure
        }
        Err(NodeError::NodeCrash(id)) => {
            log::warn!("node {id:?} crashed mid-tick; treating as failure");
            Status::Failure
        }
        Err(NodeError::ChildUnavailable(id)) => {
            log::warn!("node {id:?} is gone; requesting a rebuild of child {index}");
            let _ = report.send(WorkerReport::ChildDown(index));
            Status::Failure
        }
        Err(NodeError::NotInitialized(id)) => {
            log::error!("ticked node {id:?} outside a running tree");
            Status::Failure
        }
    }
}

/// The capability set every node kind implements. Dispatched over the closed
/// [`NodeBehavior`] variant; there is no open hierarchy of node types.
#[async_trait]
pub(crate) trait Node: Send {
    /// Once per fresh entry, before the first `update` of the run.
    async fn on_init(&mut self, _ctx: &TickCtx) -> Result<(), HandlerError> {
        Ok(())
    }

    /// One step of work. Recoverable trouble must come back as a status.
    async fn update(&mut self, ctx: &TickCtx) -> Status;

    /// Exactly once per run, with the terminal status. Implementations must
    /// leave no child running.
    async fn on_terminate(&mut self, _final_status: Status) {}

    /// Cascade an abort to children without touching local run state. Used
    /// when this node already terminated on its own.
    async fn abort_children(&mut self) {}

    /// Discard transient run state ahead of a re-entry. Children are not
    /// reset here; they re-enter themselves when next ticked.
    fn reset(&mut self) {}
}

pub(crate) enum NodeBehavior {
    Action(ActionNode),
    Decorator(decorator::DecoratorNode),
    Composite(composite::CompositeNode),
}

#[async_trait]
impl Node for NodeBehavior {
    async fn on_init(&mut self, ctx: &TickCtx) -> Result<(), HandlerError> {
        match self {
            NodeBehavior::Action(a) => a.on_init(ctx).await,
            NodeBehavior::Decorator(d) => d.on_init(ctx).await,
            NodeBehavior::Composite(c) => c.on_init(ctx).await,
        }
    }
    async fn update(&mut self, ctx: &TickCtx) -> Status {
        match self {
            NodeBehavior::Action(a) => a.update(ctx).await,
            NodeBehavior::Decorator(d) => d.update(ctx).await,
            NodeBehavior::Composite(c) => c.update(ctx).await,
        }
    }
    async fn on_terminate(&mut self, final_status: Status) {
        match self {
            NodeBehavior::Action(a) => a.on_terminate(final_status).await,
            NodeBehavior::Decorator(d) => d.on_terminate(final_status).await,
            NodeBehavior::Composite(c) => c.on_terminate(final_status).await,
        }
    }
    async fn abort_children(&mut self) {
        match self {
            NodeBehavior::Action(a) => a.abort_children().await,
            NodeBehavior::Decorator(d) => d.abort_children().await,
            NodeBehavior::Composite(c) => c.abort_children().await,
        }
    }
    fn reset(&mut self) {
        match self {
            NodeBehavior::Action(a) => a.reset(),
            NodeBehavior::Decorator(d) => d.reset(),
            NodeBehavior::Composite(c) => c.reset(),
        }
    }
}

/// A leaf running a user-supplied [`ActionHandler`]. The only node kind where
/// domain work happens; handlers get the tick context and nothing else, so
/// they cannot call back into the tree.
pub(crate) struct ActionNode {
    id: NodeId,
    handler: Box<dyn ActionHandler>,
    shared: Arc<AgentShared>,
}

impl ActionNode {
    pub(crate) fn new(id: NodeId, handler: Box<dyn ActionHandler>, shared: Arc<AgentShared>) -> Self {
        Self {
            id,
            handler,
            shared,
        }
    }

    fn record_handler_error(&self, error: &HandlerError) {
        let count = self
            .shared
            .handler_errors
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        log::warn!(
            "action {:?} handler error ({count} consecutive): {error}",
            self.id
        );
        self.shared.events.emit(Event::HandlerError {
            agent: self.shared.id.clone(),
            node: self.id,
            message: error.to_string(),
        });
    }
}

#[async_trait]
impl Node for ActionNode {
    async fn on_init(&mut self, ctx: &TickCtx) -> Result<(), HandlerError> {
        self.handler.on_init(ctx).await.map_err(|e| {
            self.record_handler_error(&e);
            e
        })
    }

    async fn update(&mut self, ctx: &TickCtx) -> Status {
        match self.handler.on_tick(ctx).await {
            Ok(Status::Fresh) => {
                log::warn!("action {:?} returned Fresh from on_tick", self.id);
                Status::Failure
            }
            Ok(status) => {
                self.shared
                    .handler_errors
                    .store(0, std::sync::atomic::Ordering::SeqCst);
                status
            }
            Err(e) => {
                self.record_handler_error(&e);
                Status::Failure
            }
        }
    }

    async fn on_terminate(&mut self, final_status: Status) {
        self.handler.on_terminate(final_status).await;
    }
}

/// Lifecycle state owned by one worker task.
pub(crate) struct Worker {
    id: NodeId,
    behavior: NodeBehavior,
    status: Status,
    /// The last tick counter this worker saw.
    last_tick: u64,
    /// The tick during which the node was aborted, if any. A tick request
    /// carrying the same counter was in flight when the abort landed and is
    /// answered `Aborted`; a later tick re-enters the node.
    aborted_tick: Option<u64>,
}

impl Worker {
    pub(crate) fn new(id: NodeId, behavior: NodeBehavior) -> Self {
        Self {
            id,
            behavior,
            status: Status::Fresh,
            last_tick: 0,
            aborted_tick: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<NodeMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                NodeMsg::Tick { ctx, reply } => {
                    let status = self.handle_tick(&ctx).await;
                    let _ = reply.send(status);
                }
                NodeMsg::Abort { reply } => {
                    self.handle_abort().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                NodeMsg::Reset { reply } => {
                    self.handle_reset();
                    let _ = reply.send(());
                }
                NodeMsg::Status { reply } => {
                    let _ = reply.send(self.status);
                }
            }
        }
    }

    async fn handle_tick(&mut self, ctx: &TickCtx) -> Status {
        self.last_tick = ctx.tick;
        match self.status {
            Status::Aborted => match self.aborted_tick {
                // the abort landed while this tick was already in flight, or
                // outside any tick: the request is discarded
                Some(t) if t >= ctx.tick => return Status::Aborted,
                None => return Status::Aborted,
                _ => self.reenter(),
            },
            s if s.is_terminal() => self.reenter(),
            _ => {}
        }

        if self.status.is_fresh() {
            if self.behavior.on_init(ctx).await.is_err() {
                self.status = Status::Failure;
                self.behavior.on_terminate(Status::Failure).await;
                return Status::Failure;
            }
            self.status = Status::Running;
        }

        let status = match self.behavior.update(ctx).await {
            Status::Fresh => {
                log::error!("node {:?} update returned Fresh", self.id);
                Status::Failure
            }
            status => status,
        };
        self.status = status;
        if status.is_terminal() {
            self.behavior.on_terminate(status).await;
        }
        status
    }

    /// Implicit re-entry: a finished node that gets ticked again starts a new
    /// run from fresh.
    fn reenter(&mut self) {
        self.behavior.reset();
        self.status = Status::Fresh;
        self.aborted_tick = None;
    }

    async fn handle_abort(&mut self) {
        let was_terminal = self.status.is_terminal();
        self.status = Status::Aborted;
        self.aborted_tick = (self.last_tick > 0).then_some(self.last_tick);
        if was_terminal {
            // its own termination hook already ran; just cascade
            self.behavior.abort_children().await;
        } else {
            self.behavior.on_terminate(Status::Aborted).await;
        }
    }

    fn handle_reset(&mut self) {
        self.status = Status::Fresh;
        self.aborted_tick = None;
        self.behavior.reset();
    }
}
