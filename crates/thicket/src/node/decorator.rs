/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Decorator nodes
//!
//! Single-child wrappers that transform or gate the child's behavior. Four
//! variants are built in: [`Inverter`], [`Repeater`], [`Timeout`] and
//! [`Conditional`]. All of them abort the child when they terminate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::From;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::action::TickCtx;
use crate::agent::AgentShared;
use crate::blackboard::BlackboardKey;
use crate::node::{child_at, tick_child, ChildTable, Node, NodeHandle, NodeId};
use crate::supervisor::WorkerReport;
use crate::Status;

/// The child of a decorator plus everything needed to drive it for one tick.
pub(crate) struct TickChild<'a> {
    child: NodeHandle,
    ctx: &'a TickCtx,
    shared: &'a AgentShared,
    report: &'a mpsc::UnboundedSender<WorkerReport>,
}

impl TickChild<'_> {
    async fn tick(&self) -> Status {
        tick_child(&self.child, 0, self.ctx, self.shared, self.report).await
    }

    async fn reset(&self) {
        if let Err(e) = self.child.reset().await {
            log::warn!("decorator could not reset its child: {e}");
        }
    }

    async fn abort(&self) {
        let _ = self.child.abort().await;
    }
}

/// Maps the child's terminal outcome to its opposite; everything else passes
/// through unchanged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Inverter;

impl Inverter {
    async fn update(&mut self, child: &TickChild<'_>) -> Status {
        !child.tick().await
    }
}

/// Re-runs the child. With `until_fail` unset the child is repeated `count`
/// successes (or forever when `count` is `None`) and a failure fails the
/// loop; with `until_fail` set the loop succeeds on the child's first
/// failure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Repeater {
    /// `None` repeats forever
    pub count: Option<u64>,
    pub until_fail: bool,

    /// Completed iterations of the current run
    iterations: u64,
}

impl Repeater {
    pub(crate) fn new(count: Option<u64>, until_fail: bool) -> Self {
        Self {
            count,
            until_fail,
            iterations: 0,
        }
    }

    fn finished(&self) -> bool {
        self.count.is_some_and(|count| self.iterations >= count)
    }

    async fn update(&mut self, child: &TickChild<'_>) -> Status {
        let status = child.tick().await;
        if self.until_fail {
            match status.failure_equivalent() {
                // the failure we were waiting for
                Status::Failure => Status::Success,
                Status::Success => {
                    child.reset().await;
                    Status::Running
                }
                other => other,
            }
        } else {
            match status.failure_equivalent() {
                Status::Success => {
                    self.iterations += 1;
                    if self.finished() {
                        Status::Success
                    } else {
                        child.reset().await;
                        Status::Running
                    }
                }
                other => other,
            }
        }
    }

    fn reset(&mut self) {
        self.iterations = 0;
    }
}

/// Fails the child if it does not finish within `duration`, aborting it on
/// the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timeout {
    pub duration: Duration,
    started: Option<Instant>,
}

impl Timeout {
    pub(crate) fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: None,
        }
    }

    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn expired(&self) -> bool {
        self.started
            .is_some_and(|started| started.elapsed() > self.duration)
    }

    async fn update(&mut self, child: &TickChild<'_>) -> Status {
        if self.started.is_none() {
            self.start();
        }
        if self.expired() {
            child.abort().await;
            return Status::Failure;
        }
        child.tick().await
    }

    fn reset(&mut self) {
        self.started = None;
    }
}

/// Gates the child on a blackboard value: the child is only ticked while
/// `(value == expected) XOR invert` holds; otherwise the gate fails without
/// touching the child. An unset key leaves the gate open.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Conditional {
    pub key: BlackboardKey,
    pub expected: Value,
    pub invert: bool,
}

impl Conditional {
    pub(crate) fn new(key: BlackboardKey, expected: Value, invert: bool) -> Self {
        Self {
            key,
            expected,
            invert,
        }
    }

    async fn update(&mut self, child: &TickChild<'_>, ctx: &TickCtx) -> Status {
        match ctx.blackboard.get(self.key.clone()).await {
            // unset key: pass through
            None => child.tick().await,
            Some(value) => {
                if (value == self.expected) ^ self.invert {
                    child.tick().await
                } else {
                    Status::Failure
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, From)]
pub(crate) enum DecoratorKind {
    Invert(Inverter),
    Repeat(Repeater),
    Timeout(Timeout),
    Conditional(Conditional),
}

/// Runtime of a decorator node: one of the variants above wrapped around a
/// single supervised child.
pub(crate) struct DecoratorNode {
    id: NodeId,
    kind: DecoratorKind,
    child: ChildTable,
    shared: Arc<AgentShared>,
    report: mpsc::UnboundedSender<WorkerReport>,
}

impl DecoratorNode {
    pub(crate) fn new(
        id: NodeId,
        kind: DecoratorKind,
        child: ChildTable,
        shared: Arc<AgentShared>,
        report: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        Self {
            id,
            kind,
            child,
            shared,
            report,
        }
    }
}

#[async_trait]
impl Node for DecoratorNode {
    async fn update(&mut self, ctx: &TickCtx) -> Status {
        let child = TickChild {
            child: child_at(&self.child, 0),
            ctx,
            shared: &self.shared,
            report: &self.report,
        };
        match &mut self.kind {
            DecoratorKind::Invert(inverter) => inverter.update(&child).await,
            DecoratorKind::Repeat(repeater) => repeater.update(&child).await,
            DecoratorKind::Timeout(timeout) => timeout.update(&child).await,
            DecoratorKind::Conditional(conditional) => conditional.update(&child, ctx).await,
        }
    }

    async fn on_terminate(&mut self, _final_status: Status) {
        if let DecoratorKind::Timeout(timeout) = &mut self.kind {
            timeout.reset();
        }
        self.abort_children().await;
    }

    async fn abort_children(&mut self) {
        let child = child_at(&self.child, 0);
        if let Err(e) = child.abort().await {
            log::debug!("decorator {:?} could not abort its child: {e}", self.id);
        }
    }

    fn reset(&mut self) {
        match &mut self.kind {
            DecoratorKind::Invert(_) | DecoratorKind::Conditional(_) => {}
            DecoratorKind::Repeat(repeater) => repeater.reset(),
            DecoratorKind::Timeout(timeout) => timeout.reset(),
        }
    }
}
