/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Thicket
//!
//! A supervised, concurrent behavior tree runtime for populations of
//! autonomous agents.
//!
//! ## Motivation
//!
//! Fundamentally behavior trees are _simple_: leaf nodes perform some action
//! and return a status, all other nodes determine how tree traversal is done,
//! effectively controlling which actions get executed and in what order. The
//! part that is not simple is keeping a population of trees alive: an action
//! that panics, wedges, or misses its deadline must not take the rest of the
//! tree (let alone the rest of the population) down with it.
//!
//! Thicket therefore runs every node as its own unit of concurrency:
//!
//! - Each node is a pair of tokio tasks, a long-lived **supervisor** and a
//!   replaceable **worker**. Parents talk to the supervisor's mailbox, so a
//!   worker crash is invisible to the rest of the tree beyond a single
//!   `Failure` status.
//! - Ticks are request/reply messages flowing root-to-leaf, each bounded by a
//!   per-tick deadline. A child that misses the deadline is aborted and
//!   reported as `Failure`, not awaited forever.
//! - Shared state lives in a per-agent [`blackboard`](crate::blackboard) with
//!   publish/subscribe, the only mutable surface actions may touch.
//!
//! ## Control vs. execution
//!
//! Control flow (sequences, selectors, parallels, decorators) is delineated
//! from execution (leaf actions). Control nodes are built-in and configured
//! declaratively; execution is supplied by the host through the
//! [`ActionHandler`](crate::action::ActionHandler) trait and looked up by
//! name in an [`ActionRegistry`](crate::action::ActionRegistry). Actions
//! never call back into the tree.
//!
//! ## Getting a tree running
//!
//! ```rust,no_run
//! use thicket::prelude::*;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = ActionRegistry::new();
//! registry.register("beep", |_params| {
//!     Ok(Box::new(FnAction::new(|_ctx| Status::Success)) as Box<dyn ActionHandler>)
//! });
//!
//! let spec = AgentSpec::new(
//!     "automaton-1",
//!     NodeSpec::sequence([NodeSpec::action("beep"), NodeSpec::action("beep")]),
//! );
//!
//! let agent = Agent::spawn(spec, &registry).await?;
//! let _status = agent.tick().await?;
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod action;
pub mod agent;
pub mod blackboard;
pub mod config;
pub mod event;
pub mod graphviz;
pub mod node;
pub mod population;
pub mod supervisor;
pub mod tick;

pub mod prelude {
    pub use crate::action::{ActionHandler, ActionRegistry, FnAction, HandlerError, TickCtx};
    pub use crate::agent::{Agent, AgentHandle, AgentId};
    pub use crate::blackboard::{
        BlackboardHandle, BlackboardKey, Change, ChangeOp, Pattern, SHARED_SEGMENT,
    };
    pub use crate::config::{AgentSpec, CompositeVariant, DecoratorVariant, NodeSpec};
    pub use crate::event::{Event, EventKind, TerminateReason};
    pub use crate::node::{NodeError, NodeId};
    pub use crate::population::Population;

    pub use crate::{Status, ThicketError, ThicketResult};
}

/// Errors surfaced while interpreting an agent description. All of these are
/// fatal at agent start; none of them can be reached once a tree is running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThicketError {
    #[error("ThicketError: Agent description is not valid: {0}")]
    Spec(String),

    #[error("ThicketError: Agent type {0:?} is not supported")]
    UnsupportedAgentType(String),

    #[error("ThicketError: Composite at {0} has no children")]
    EmptyComposite(String),

    #[error("ThicketError: No action handler registered under {0:?}")]
    UnknownHandler(String),

    #[error("ThicketError: Invalid parameters at {at}: {message}")]
    InvalidParameters { at: String, message: String },

    #[error("\
        ThicketError: Parallel at {at} has unsatisfiable thresholds: \
        success_threshold {success} + failure_threshold {failure} must exceed {children} children")]
    InvalidThresholds {
        at: String,
        success: usize,
        failure: usize,
        children: usize,
    },
}

pub type ThicketResult<T> = Result<T, ThicketError>;

/// The status a node reports when ticked.
///
/// `Fresh` is the initial (and post-reset) state, `Running` the only
/// non-terminal working state. `Success`, `Failure` and `Aborted` are
/// terminal; `Aborted` is reachable only through an explicit abort.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Node has not run since creation or its last reset
    #[default]
    Fresh,

    /// Node has more work to do; tick it again
    Running,

    /// Node succeeded
    Success,

    /// Node failed
    Failure,

    /// Node was aborted before reaching `Success` or `Failure`
    Aborted,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure() || self.is_aborted()
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Status::Fresh)
    }
    pub fn is_running(&self) -> bool {
        matches!(self, Status::Running)
    }
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failure)
    }
    pub fn is_aborted(&self) -> bool {
        matches!(self, Status::Aborted)
    }

    /// Collapse `Aborted` into `Failure` for status-combination purposes.
    /// Composites never retry an aborted child within the same tick, but they
    /// count it as a failed one.
    pub fn failure_equivalent(self) -> Self {
        if self.is_aborted() {
            Status::Failure
        } else {
            self
        }
    }

    /// Combine child statuses the way a sequence does: the first status that
    /// is not `Success` wins, otherwise `Success`. An empty input is
    /// `Success`.
    pub fn combine_sequence(statuses: impl IntoIterator<Item = Status>) -> Status {
        statuses
            .into_iter()
            .map(Status::failure_equivalent)
            .find(|s| !s.is_success())
            .unwrap_or(Status::Success)
    }

    /// Combine child statuses the way a selector does: the first status that
    /// is not `Failure` wins, otherwise `Failure`. An empty input is
    /// `Failure`.
    pub fn combine_selector(statuses: impl IntoIterator<Item = Status>) -> Status {
        statuses
            .into_iter()
            .map(Status::failure_equivalent)
            .find(|s| !s.is_failure())
            .unwrap_or(Status::Failure)
    }

    /// Combine child statuses the way a parallel does, with a success
    /// threshold `m` and a failure threshold `n`.
    ///
    /// If both thresholds are crossed in the same tick, success wins.
    pub fn combine_parallel(
        m: usize,
        n: usize,
        statuses: impl IntoIterator<Item = Status>,
    ) -> Status {
        let (mut successes, mut failures) = (0usize, 0usize);
        for status in statuses {
            match status.failure_equivalent() {
                Status::Success => successes += 1,
                Status::Failure => failures += 1,
                _ => {}
            }
        }
        if successes >= m {
            Status::Success
        } else if failures >= n {
            Status::Failure
        } else {
            Status::Running
        }
    }
}

impl std::ops::Not for Status {
    type Output = Self;
    /// Invert the status.
    ///
    /// NOTE: only the terminal outcomes flip; everything else is a fixpoint.
    ///
    /// |    | Fresh | Running | Success | Failure | Aborted |
    /// | -- | ----- | ------- | ------- | ------- | ------- |
    /// | !  | Fresh | Running | Failure | Success | Aborted |
    fn not(self) -> Self {
        match self {
            Status::Success => Status::Failure,
            Status::Failure => Status::Success,
            other => other,
        }
    }
}

impl From<bool> for Status {
    fn from(val: bool) -> Self {
        if val {
            Status::Success
        } else {
            Status::Failure
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invert_flips_terminal_outcomes_only() {
        assert_eq!(!Status::Success, Status::Failure);
        assert_eq!(!Status::Failure, Status::Success);
        assert_eq!(!Status::Running, Status::Running);
        assert_eq!(!Status::Aborted, Status::Aborted);
        assert_eq!(!Status::Fresh, Status::Fresh);
    }

    #[test]
    fn sequence_combination_short_circuits() {
        use Status::*;
        assert_eq!(Status::combine_sequence([Success, Success]), Success);
        assert_eq!(
            Status::combine_sequence([Success, Running, Failure]),
            Running
        );
        assert_eq!(Status::combine_sequence([Failure, Success]), Failure);
        assert_eq!(Status::combine_sequence([Success, Aborted]), Failure);
        assert_eq!(Status::combine_sequence([]), Success);
    }

    #[test]
    fn selector_combination_short_circuits() {
        use Status::*;
        assert_eq!(Status::combine_selector([Failure, Success]), Success);
        assert_eq!(
            Status::combine_selector([Failure, Running, Success]),
            Running
        );
        assert_eq!(Status::combine_selector([Failure, Failure]), Failure);
        assert_eq!(Status::combine_selector([Aborted, Failure]), Failure);
        assert_eq!(Status::combine_selector([]), Failure);
    }

    #[test]
    fn parallel_combination_success_wins_double_cross() {
        use Status::*;
        // one success and one failure with both thresholds at 1: success wins
        assert_eq!(Status::combine_parallel(1, 1, [Success, Failure]), Success);
        assert_eq!(
            Status::combine_parallel(2, 2, [Success, Failure, Running]),
            Running
        );
        assert_eq!(
            Status::combine_parallel(2, 2, [Success, Failure, Success]),
            Success
        );
        assert_eq!(
            Status::combine_parallel(2, 2, [Aborted, Failure, Running]),
            Failure
        );
        // vacuous success threshold on an empty child list
        assert_eq!(Status::combine_parallel(0, 1, []), Success);
    }
}
