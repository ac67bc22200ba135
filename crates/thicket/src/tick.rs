/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Tick scheduler
//!
//! One heartbeat task per agent. The scheduler fires on a fixed grid
//! (`previous_fire + period`, not `now + period`, so the beat does not
//! drift), delivers a tick to the root and waits for the reply before
//! considering the next slot; a tick that overruns its deadline causes the
//! missed slots to be skipped rather than bunched up.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::action::TickCtx;
use crate::agent::AgentShared;
use crate::event::{Event, TerminateReason};
use crate::node::{NodeError, NodeHandle};
use crate::Status;

/// Deliver exactly one tick to the root and wait for its status, bounded by
/// the agent's tick deadline. Shared by the scheduler and by hosts driving an
/// agent manually.
pub(crate) async fn drive_tick(
    root: &NodeHandle,
    shared: &AgentShared,
) -> Result<Status, NodeError> {
    if shared.cancel.is_cancelled() {
        return Err(NodeError::NotInitialized(root.id()));
    }
    let tick = shared.tick_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let ctx = TickCtx {
        agent_id: shared.id.clone(),
        tick,
        deadline: Instant::now() + shared.tick_deadline,
        blackboard: shared.blackboard.clone(),
    };
    let result = root.tick(ctx).await;

    if let Err(NodeError::ChildTimeout(node)) = &result {
        shared.events.emit(Event::TickDeadlineExceeded {
            agent: shared.id.clone(),
            node: *node,
            elapsed: shared.tick_deadline,
        });
    }

    let errors = shared.handler_errors.load(Ordering::SeqCst);
    if errors >= shared.handler_error_cap {
        log::error!(
            "agent {} hit {errors} consecutive handler errors; shutting down",
            shared.id
        );
        shared.events.emit(Event::AgentTerminated {
            agent: shared.id.clone(),
            reason: TerminateReason::HandlerErrors(errors),
        });
        shared.cancel.cancel();
    }

    result
}

pub(crate) async fn run_scheduler(root: NodeHandle, shared: Arc<AgentShared>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    // fall behind by more than a period and we skip to the nearest future
    // slot instead of firing a burst
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {
                match drive_tick(&root, &shared).await {
                    Ok(_) => {}
                    // not fatal: the deadline event is out and the interval
                    // skips whatever slots the overrun consumed
                    Err(NodeError::ChildTimeout(_)) => {}
                    // the root's supervisor is already replacing the worker
                    Err(NodeError::NodeCrash(_)) => {}
                    Err(NodeError::ChildUnavailable(_)) | Err(NodeError::NotInitialized(_)) => {
                        if !shared.cancel.is_cancelled() {
                            shared.events.emit(Event::AgentTerminated {
                                agent: shared.id.clone(),
                                reason: TerminateReason::Escalated,
                            });
                            shared.cancel.cancel();
                        }
                        break;
                    }
                }
                if shared.cancel.is_cancelled() {
                    break;
                }
            }
        }
    }
}
