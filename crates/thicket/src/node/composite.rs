/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Composite nodes
//!
//! Multi-child control flow. Each composite runs a left-to-right pass over
//! its children per tick and folds their statuses by a fixed rule:
//!
//! - [`Sequence`]: first non-success wins; restarts from child 0 every tick.
//! - [`Selector`]: first non-failure wins.
//! - [`Parallel`]: every child ticks concurrently in the same tick;
//!   threshold counts decide the outcome, merged deterministically by child
//!   index.
//! - [`SequenceWithMemory`]: a sequence that resumes from the last running
//!   child instead of restarting.
//!
//! An aborted child counts as failed but is never retried within the tick.

use std::sync::Arc;

use async_trait::async_trait;
use derive_more::From;
use tokio::sync::mpsc;

use crate::action::TickCtx;
use crate::agent::AgentShared;
use crate::node::{child_at, child_count, tick_child, ChildTable, Node, NodeId};
use crate::supervisor::WorkerReport;
use crate::Status;

/// The ordered children of a composite plus everything needed to drive them
/// for one tick.
pub(crate) struct TickChildren<'a> {
    children: &'a ChildTable,
    ctx: &'a TickCtx,
    shared: &'a AgentShared,
    report: &'a mpsc::UnboundedSender<WorkerReport>,
}

impl TickChildren<'_> {
    fn count(&self) -> usize {
        child_count(self.children)
    }

    async fn tick(&self, index: usize) -> Status {
        let child = child_at(self.children, index);
        tick_child(&child, index, self.ctx, self.shared, self.report).await
    }
}

/// Ticks children in order, restarting from child 0 every tick. The first
/// child that is not successful decides the outcome; children after it are
/// not ticked this tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Sequence;

impl Sequence {
    async fn update(&mut self, children: &TickChildren<'_>) -> Status {
        for index in 0..children.count() {
            match children.tick(index).await {
                Status::Success => continue,
                status => return status.failure_equivalent(),
            }
        }
        Status::Success
    }
}

/// Dual of [`Sequence`]: ticks children in order until one of them does not
/// fail, short-circuiting on the first success.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Selector;

impl Selector {
    async fn update(&mut self, children: &TickChildren<'_>) -> Status {
        for index in 0..children.count() {
            match children.tick(index).await.failure_equivalent() {
                Status::Failure => continue,
                status => return status,
            }
        }
        Status::Failure
    }
}

/// Ticks every child concurrently in the same tick, independent of earlier
/// children's results. Succeeds once `success_threshold` children have
/// succeeded, fails once `failure_threshold` have failed; if both cross in
/// one tick, success wins. Children that already reached a terminal status
/// within this run are not re-ticked.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Parallel {
    pub success_threshold: usize,
    pub failure_threshold: usize,

    /// Outcome of each child within the current run, by child index.
    completed: Vec<Option<Status>>,
}

impl Parallel {
    pub(crate) fn new(success_threshold: usize, failure_threshold: usize) -> Self {
        Self {
            success_threshold,
            failure_threshold,
            completed: Vec::new(),
        }
    }

    async fn update(&mut self, children: &TickChildren<'_>) -> Status {
        let count = children.count();
        if self.completed.len() != count {
            self.completed = vec![None; count];
        }

        let pending = (0..count)
            .filter(|&index| !self.completed[index].is_some_and(|s| s.is_terminal()))
            .map(|index| async move { (index, children.tick(index).await) });
        // join_all keeps input order, so the merge is deterministic by index
        for (index, status) in futures::future::join_all(pending).await {
            self.completed[index] = Some(status);
        }

        Status::combine_parallel(
            self.success_threshold,
            self.failure_threshold,
            self.completed.iter().flatten().copied(),
        )
    }

    /// Child indexes with no terminal outcome in the current run.
    fn still_running(&self) -> Vec<usize> {
        self.completed
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_some_and(|s| s.is_terminal()))
            .map(|(index, _)| index)
            .collect()
    }

    fn reset(&mut self) {
        self.completed.clear();
    }
}

/// Per-run record of a [`SequenceWithMemory`]: where to resume, and what each
/// visited child reported. Kept across failed runs so a recovering tree picks
/// up where it left off; discarded once the sequence succeeds.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct MemoryRecord {
    pub last_running_index: usize,
    pub history: ahash::HashMap<usize, Status>,
}

/// A sequence that remembers. When a child reports `Running` the composite
/// records its index and the next tick resumes there instead of re-ticking
/// earlier children.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SequenceWithMemory {
    memory: Option<MemoryRecord>,
}

impl SequenceWithMemory {
    fn record(&mut self) -> &mut MemoryRecord {
        self.memory.get_or_insert_with(MemoryRecord::default)
    }

    async fn update(&mut self, children: &TickChildren<'_>) -> Status {
        let start = self.record().last_running_index;
        for index in start..children.count() {
            let status = children.tick(index).await;
            let record = self.record();
            record.history.insert(index, status);
            match status {
                Status::Success => continue,
                Status::Running => {
                    record.last_running_index = index;
                    return Status::Running;
                }
                status => {
                    record.last_running_index = index;
                    return status.failure_equivalent();
                }
            }
        }
        Status::Success
    }

    fn on_terminate(&mut self, final_status: Status) {
        if final_status.is_success() {
            self.memory = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, From)]
pub(crate) enum CompositeKind {
    Sequence(Sequence),
    Selector(Selector),
    Parallel(Parallel),
    SequenceWithMemory(SequenceWithMemory),
}

/// Runtime of a composite node: one of the variants above over an ordered
/// table of supervised children.
pub(crate) struct CompositeNode {
    id: NodeId,
    kind: CompositeKind,
    children: ChildTable,
    shared: Arc<AgentShared>,
    report: mpsc::UnboundedSender<WorkerReport>,
}

impl CompositeNode {
    pub(crate) fn new(
        id: NodeId,
        kind: CompositeKind,
        children: ChildTable,
        shared: Arc<AgentShared>,
        report: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        Self {
            id,
            kind,
            children,
            shared,
            report,
        }
    }

    async fn abort_child(&self, index: usize) {
        let child = child_at(&self.children, index);
        if let Err(e) = child.abort().await {
            log::debug!("composite {:?} could not abort child {index}: {e}", self.id);
        }
    }
}

#[async_trait]
impl Node for CompositeNode {
    async fn update(&mut self, ctx: &TickCtx) -> Status {
        let children = TickChildren {
            children: &self.children,
            ctx,
            shared: &self.shared,
            report: &self.report,
        };
        match &mut self.kind {
            CompositeKind::Sequence(sequence) => sequence.update(&children).await,
            CompositeKind::Selector(selector) => selector.update(&children).await,
            CompositeKind::Parallel(parallel) => parallel.update(&children).await,
            CompositeKind::SequenceWithMemory(swm) => swm.update(&children).await,
        }
    }

    async fn on_terminate(&mut self, final_status: Status) {
        if let CompositeKind::SequenceWithMemory(swm) = &mut self.kind {
            swm.on_terminate(final_status);
        }
        if let CompositeKind::Parallel(parallel) = &self.kind {
            // children that never finished this run must not keep working
            let still_running = parallel.still_running();
            for index in still_running {
                self.abort_child(index).await;
            }
        }
        if final_status.is_aborted() {
            self.abort_children().await;
        }
    }

    async fn abort_children(&mut self) {
        for index in 0..child_count(&self.children) {
            self.abort_child(index).await;
        }
    }

    fn reset(&mut self) {
        match &mut self.kind {
            CompositeKind::Sequence(_) | CompositeKind::Selector(_) => {}
            CompositeKind::Parallel(parallel) => parallel.reset(),
            // the memory record is persistent state, not transient: it only
            // clears when the sequence terminates successfully
            CompositeKind::SequenceWithMemory(_) => {}
        }
    }
}
