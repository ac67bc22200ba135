/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Per-node supervision
//!
//! The supervision topology mirrors the tree: every node gets a supervisor
//! task that owns the node's mailbox, its child subtrees and a replaceable
//! worker task running the actual [`NodeBehavior`](crate::node::NodeBehavior).
//!
//! Faults are handled at two boundaries:
//!
//! - **Worker crash** (a panic inside `update` or a handler): the supervisor
//!   replaces just the worker, keeping the children — siblings never notice.
//!   Each replacement counts against the restart budget.
//! - **Budget exceeded**: the supervisor aborts its children and closes its
//!   mailbox. The parent observes `ChildUnavailable` on its next tick and
//!   asks *its* supervisor to rebuild the whole subtree from the blueprint.
//!
//! Because parents hold the supervisor's mailbox, not the worker's, a restart
//! never invalidates a handle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::agent::AgentShared;
use crate::config::{
    BlueprintKind, CompositeParams, CompositeVariant, DecoratorParams, NodeBlueprint,
};
use crate::event::Event;
use crate::node::composite::{
    CompositeKind, CompositeNode, Parallel, Selector, Sequence, SequenceWithMemory,
};
use crate::node::decorator::{Conditional, DecoratorKind, DecoratorNode, Inverter, Repeater, Timeout};
use crate::node::{ActionNode, ChildTable, NodeBehavior, NodeHandle, NodeMsg, Worker};
use crate::ThicketResult;

/// How often a node's worker may be replaced before the supervisor gives up
/// and escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(3600),
        }
    }
}

/// Side channel from a worker to its own supervisor.
pub(crate) enum WorkerReport {
    /// Child `index`'s mailbox is closed; its subtree must be rebuilt.
    ChildDown(usize),
}

/// Spawn the supervisor (and, transitively, the whole subtree) described by
/// `blueprint`, returning the parent-facing handle.
pub(crate) fn spawn_node(blueprint: Arc<NodeBlueprint>, shared: Arc<AgentShared>) -> NodeHandle {
    let (tx, rx) = mpsc::channel(16);
    let handle = NodeHandle::new(blueprint.id, tx);
    tokio::spawn(supervise(blueprint, shared, rx));
    handle
}

async fn supervise(
    blueprint: Arc<NodeBlueprint>,
    shared: Arc<AgentShared>,
    mut rx: mpsc::Receiver<NodeMsg>,
) {
    let children: ChildTable = Arc::new(parking_lot::Mutex::new(
        blueprint
            .children
            .iter()
            .map(|child| spawn_node(child.clone(), shared.clone()))
            .collect(),
    ));
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();

    let (mut worker_join, mut worker_tx) =
        match spawn_worker(&blueprint, &children, &report_tx, &shared) {
            Ok(worker) => worker,
            Err(e) => {
                // compile probed every factory, so this is a factory that
                // succeeds at start and fails later; nothing to do but vanish
                log::error!("node {:?} could not build its worker: {e}", blueprint.id);
                abort_children(&children).await;
                return;
            }
        };
    let mut restarts: VecDeque<Instant> = VecDeque::new();
    // messages that arrived while the worker was down
    let mut pending: VecDeque<NodeMsg> = VecDeque::new();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,

            exit = &mut worker_join => {
                let reason = exit_reason(exit);
                if !restart_allowed(&mut restarts, &shared.restart_policy) {
                    log::error!(
                        "node {:?} exceeded {} restarts per {:?}; escalating",
                        blueprint.id,
                        shared.restart_policy.max_restarts,
                        shared.restart_policy.window,
                    );
                    abort_children(&children).await;
                    return;
                }
                log::warn!("restarting node {:?}: {reason}", blueprint.id);
                shared.events.emit(Event::NodeRestarted {
                    agent: shared.id.clone(),
                    node: blueprint.id,
                    reason,
                });
                match spawn_worker(&blueprint, &children, &report_tx, &shared) {
                    Ok((join, tx)) => {
                        worker_join = join;
                        worker_tx = tx;
                    }
                    Err(e) => {
                        log::error!("node {:?} could not rebuild its worker: {e}", blueprint.id);
                        abort_children(&children).await;
                        return;
                    }
                }
                while let Some(msg) = pending.pop_front() {
                    if let Err(send_failed) = worker_tx.send(msg).await {
                        pending.push_front(send_failed.0);
                        break;
                    }
                }
            }

            Some(report) = report_rx.recv() => match report {
                WorkerReport::ChildDown(index) => {
                    let child_blueprint = blueprint.children[index].clone();
                    let node = child_blueprint.id;
                    log::warn!("rebuilding subtree under node {node:?}");
                    let fresh = spawn_node(child_blueprint, shared.clone());
                    children.lock()[index] = fresh;
                    shared.events.emit(Event::NodeRebuilt {
                        agent: shared.id.clone(),
                        node,
                    });
                }
            },

            msg = rx.recv() => match msg {
                // every handle is gone; the tree is winding down
                None => break,
                Some(msg) => {
                    if let Err(send_failed) = worker_tx.send(msg).await {
                        // worker just died; the exit arm will respawn and drain
                        pending.push_back(send_failed.0);
                    }
                }
            },
        }
    }
    worker_join.abort();
}

type WorkerSlot = (JoinHandle<()>, mpsc::Sender<NodeMsg>);

fn spawn_worker(
    blueprint: &Arc<NodeBlueprint>,
    children: &ChildTable,
    report: &mpsc::UnboundedSender<WorkerReport>,
    shared: &Arc<AgentShared>,
) -> ThicketResult<WorkerSlot> {
    let behavior = build_behavior(blueprint, children, report, shared)?;
    let (tx, rx) = mpsc::channel(16);
    let join = tokio::spawn(Worker::new(blueprint.id, behavior).run(rx));
    Ok((join, tx))
}

fn build_behavior(
    blueprint: &Arc<NodeBlueprint>,
    children: &ChildTable,
    report: &mpsc::UnboundedSender<WorkerReport>,
    shared: &Arc<AgentShared>,
) -> ThicketResult<NodeBehavior> {
    Ok(match &blueprint.kind {
        BlueprintKind::Action {
            factory,
            parameters,
        } => {
            let handler = factory(parameters)?;
            NodeBehavior::Action(ActionNode::new(blueprint.id, handler, shared.clone()))
        }
        BlueprintKind::Decorator(_, params) => {
            let kind: DecoratorKind = match params {
                DecoratorParams::Inverter => Inverter.into(),
                DecoratorParams::Repeater { count, until_fail } => {
                    Repeater::new(*count, *until_fail).into()
                }
                DecoratorParams::Timeout { duration } => Timeout::new(*duration).into(),
                DecoratorParams::Conditional {
                    key,
                    expected,
                    invert,
                } => Conditional::new(key.clone(), expected.clone(), *invert).into(),
            };
            NodeBehavior::Decorator(DecoratorNode::new(
                blueprint.id,
                kind,
                children.clone(),
                shared.clone(),
                report.clone(),
            ))
        }
        BlueprintKind::Composite(variant, params) => {
            let kind: CompositeKind = match (variant, params) {
                (CompositeVariant::Sequence, _) => Sequence.into(),
                (CompositeVariant::Selector, _) => Selector.into(),
                (CompositeVariant::SequenceWithMemory, _) => SequenceWithMemory::default().into(),
                (
                    CompositeVariant::Parallel,
                    CompositeParams::Parallel {
                        success_threshold,
                        failure_threshold,
                    },
                ) => Parallel::new(*success_threshold, *failure_threshold).into(),
                // a parallel never compiles without parsed thresholds
                (CompositeVariant::Parallel, CompositeParams::Plain) => Parallel::new(1, 1).into(),
            };
            NodeBehavior::Composite(CompositeNode::new(
                blueprint.id,
                kind,
                children.clone(),
                shared.clone(),
                report.clone(),
            ))
        }
    })
}

/// Record a restart against the budget; `false` means the budget is spent
/// and the supervisor must escalate.
fn restart_allowed(restarts: &mut VecDeque<Instant>, policy: &RestartPolicy) -> bool {
    let now = Instant::now();
    while restarts
        .front()
        .is_some_and(|t| now.duration_since(*t) > policy.window)
    {
        restarts.pop_front();
    }
    if restarts.len() >= policy.max_restarts as usize {
        return false;
    }
    restarts.push_back(now);
    true
}

async fn abort_children(children: &ChildTable) {
    let handles: Vec<NodeHandle> = children.lock().clone();
    for child in handles {
        let _ = child.abort().await;
    }
}

fn exit_reason(exit: Result<(), JoinError>) -> String {
    match exit {
        Ok(()) => "worker stopped unexpectedly".to_string(),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            if let Some(message) = panic.downcast_ref::<&str>() {
                format!("panic: {message}")
            } else if let Some(message) = panic.downcast_ref::<String>() {
                format!("panic: {message}")
            } else {
                "panic".to_string()
            }
        }
        Err(e) => format!("worker task error: {e}"),
    }
}
