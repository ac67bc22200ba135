//! Fault isolation and the runtime half of the contract: timeouts, worker
//! crashes, subtree rebuilds, aborts and the scheduler.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use thicket::action::{ActionHandler, FnAction, HandlerError, TickCtx};
use thicket::prelude::*;

/// Sleeps well past the tick deadline on its first run, then responds
/// instantly.
struct SlowOnce {
    slept: bool,
}

#[async_trait]
impl ActionHandler for SlowOnce {
    async fn on_tick(&mut self, _ctx: &TickCtx) -> Result<Status, HandlerError> {
        if !self.slept {
            self.slept = true;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(Status::Success)
    }
}

/// Always reports a handler error.
struct Failing;

#[async_trait]
impl ActionHandler for Failing {
    async fn on_tick(&mut self, _ctx: &TickCtx) -> Result<Status, HandlerError> {
        Err(HandlerError::new("sensor offline"))
    }
}

async fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut out = vec![];
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// A timeout around an action that never finishes: the decorator fails after
/// its window and the action is aborted exactly once.
#[tokio::test]
async fn timeout_aborts_a_wedged_action() {
    let log = new_log();
    let registry = scripted_registry(&log);
    let agent = Agent::spawn(
        AgentSpec::manual(
            "timeouts",
            NodeSpec::timeout(100, scripted("long", &["running"])),
        ),
        &registry,
    )
    .await
    .unwrap();

    let mut status = agent.tick().await.unwrap();
    for _ in 0..20 {
        if status != Status::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        status = agent.tick().await.unwrap();
    }

    assert_eq!(status, Status::Failure, "the timeout must fail the branch");
    assert_eq!(
        terminations_of(&log, "long"),
        vec![Status::Aborted],
        "the wedged action must be aborted exactly once"
    );
    agent.shutdown().await;
}

/// A crash in one child is invisible to its siblings: the tick degrades to a
/// failure, the worker is replaced, and the next tick can succeed.
#[tokio::test]
async fn crash_is_isolated_and_the_worker_restarted() {
    let log = new_log();
    let mut registry = scripted_registry(&log);
    let crash_once = Arc::new(AtomicBool::new(true));
    registry.register("crashy", move |_params| {
        let crash_once = crash_once.clone();
        Ok(Box::new(FnAction::new(move |_ctx| {
            if crash_once.swap(false, Ordering::SeqCst) {
                panic!("synthetic crash");
            }
            Status::Success
        })) as Box<dyn ActionHandler>)
    });

    let agent = Agent::spawn(
        AgentSpec::manual(
            "crashy-agent",
            NodeSpec::sequence([
                scripted("A", &["success"]),
                NodeSpec::action("crashy"),
                scripted("C", &["success"]),
            ]),
        ),
        &registry,
    )
    .await
    .unwrap();
    let mut events = agent.events();

    assert_eq!(
        agent.tick().await.unwrap(),
        Status::Failure,
        "a crash surfaces as failure, never as an error at the root"
    );
    assert_eq!(ticks_of(&log, "A"), vec![Status::Success]);
    assert!(ticks_of(&log, "C").is_empty());

    // give the supervisor a beat to replace the worker
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(agent.tick().await.unwrap(), Status::Success);
    assert_eq!(ticks_of(&log, "A").len(), 2);
    assert_eq!(ticks_of(&log, "C").len(), 1);

    let restarts: Vec<NodeId> = drain(&mut events)
        .await
        .into_iter()
        .filter_map(|event| match event {
            Event::NodeRestarted { node, .. } => Some(node),
            _ => None,
        })
        .collect();
    assert_eq!(
        restarts,
        vec![NodeId::from(2)],
        "only the crashed node restarts"
    );
    agent.shutdown().await;
}

/// Past the restart budget the node's supervisor gives up and the parent
/// rebuilds the whole subtree from the blueprint.
#[tokio::test]
async fn restart_budget_escalates_to_a_rebuild() {
    let log = new_log();
    let mut registry = scripted_registry(&log);
    registry.register("doomed", |_params| {
        Ok(Box::new(FnAction::new(|_ctx| -> Status {
            panic!("always crashes");
        })) as Box<dyn ActionHandler>)
    });

    let mut spec = AgentSpec::manual(
        "doomed-agent",
        NodeSpec::sequence([scripted("A", &["success"]), NodeSpec::action("doomed")]),
    );
    spec.max_restarts = 1;

    let agent = Agent::spawn(spec, &registry).await.unwrap();
    let mut events = agent.events();

    // crash 1: restarted; crash 2: budget spent, supervisor escalates;
    // then the parent notices the closed mailbox and rebuilds
    for _ in 0..4 {
        assert_eq!(agent.tick().await.unwrap(), Status::Failure);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let seen = drain(&mut events).await;
    assert!(
        seen.iter()
            .any(|e| matches!(e, Event::NodeRestarted { node, .. } if node.index() == 2)),
        "expected a NodeRestarted for the crashy node, got {seen:?}"
    );
    assert!(
        seen.iter()
            .any(|e| matches!(e, Event::NodeRebuilt { node, .. } if node.index() == 2)),
        "expected a NodeRebuilt after escalation, got {seen:?}"
    );
    // the sibling kept working the whole time
    assert_eq!(ticks_of(&log, "A").len(), 4);
    agent.shutdown().await;
}

/// Aborting the root terminates every descendant exactly once, including
/// children that never started, and a reset lets the tree run again.
#[tokio::test]
async fn abort_cascades_exactly_once() {
    let log = new_log();
    let registry = scripted_registry(&log);
    let agent = Agent::spawn(
        AgentSpec::manual(
            "abortable",
            NodeSpec::sequence([scripted("A", &["running"]), scripted("B", &["success"])]),
        ),
        &registry,
    )
    .await
    .unwrap();

    assert_eq!(agent.tick().await.unwrap(), Status::Running);

    agent.abort().await.unwrap();
    assert_eq!(agent.status().await.unwrap(), Status::Aborted);
    assert_eq!(terminations_of(&log, "A"), vec![Status::Aborted]);
    assert_eq!(
        terminations_of(&log, "B"),
        vec![Status::Aborted],
        "a child that never ran still terminates aborted"
    );

    // idempotent: a second abort changes nothing
    agent.abort().await.unwrap();
    assert_eq!(terminations_of(&log, "A"), vec![Status::Aborted]);
    assert_eq!(terminations_of(&log, "B"), vec![Status::Aborted]);

    // a reset clears the way for a fresh run
    agent.reset().await.unwrap();
    assert_eq!(agent.tick().await.unwrap(), Status::Running);
    assert_eq!(ticks_of(&log, "A").len(), 2);
    agent.shutdown().await;
}

/// Consecutive handler errors are capped: the agent shuts itself down and
/// later ticks report that the tree is gone.
#[tokio::test]
async fn consecutive_handler_errors_terminate_the_agent() {
    let log = new_log();
    let mut registry = scripted_registry(&log);
    registry.register("failing", |_params| Ok(Box::new(Failing) as Box<dyn ActionHandler>));

    let mut spec = AgentSpec::manual("erroring", NodeSpec::action("failing"));
    spec.max_handler_errors = 2;

    let agent = Agent::spawn(spec, &registry).await.unwrap();
    let mut events = agent.events();

    assert_eq!(agent.tick().await.unwrap(), Status::Failure);
    assert_eq!(agent.tick().await.unwrap(), Status::Failure);
    assert!(
        agent.tick().await.is_err(),
        "the agent should be gone after hitting the error cap"
    );

    let seen = drain(&mut events).await;
    let handler_errors = seen
        .iter()
        .filter(|e| matches!(e, Event::HandlerError { .. }))
        .count();
    assert_eq!(handler_errors, 2);
    assert!(seen.iter().any(|e| matches!(
        e,
        Event::AgentTerminated {
            reason: TerminateReason::HandlerErrors(2),
            ..
        }
    )));
    agent.shutdown().await;
}

/// A tick that blows the deadline is aborted, reported, and the next tick
/// recovers.
#[tokio::test]
async fn tick_deadline_aborts_and_recovers() {
    let log = new_log();
    let mut registry = scripted_registry(&log);
    registry.register("slow_once", |_params| {
        Ok(Box::new(SlowOnce { slept: false }) as Box<dyn ActionHandler>)
    });

    let mut spec = AgentSpec::manual("deadline", NodeSpec::action("slow_once"));
    spec.tick_deadline_ms = 50;

    let agent = Agent::spawn(spec, &registry).await.unwrap();
    let mut events = agent.events();

    assert!(matches!(
        agent.tick().await,
        Err(NodeError::ChildTimeout(_))
    ));
    let seen = drain(&mut events).await;
    assert!(
        seen.iter()
            .any(|e| matches!(e, Event::TickDeadlineExceeded { .. })),
        "expected a deadline event, got {seen:?}"
    );

    // let the late worker drain its mailbox, then re-enter
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(agent.tick().await.unwrap(), Status::Success);
    agent.shutdown().await;
}

/// The scheduler heartbeats on its own and stops with the agent.
#[tokio::test]
async fn scheduler_drives_ticks_until_shutdown() {
    let log = new_log();
    let registry = scripted_registry(&log);
    let mut spec = AgentSpec::new("heartbeat", scripted("beat", &["success"]));
    spec.tick_freq_ms = 20;

    let agent = Agent::spawn(spec, &registry).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    agent.shutdown().await;

    let beats = ticks_of(&log, "beat").len();
    assert!(beats >= 3, "expected at least 3 scheduled ticks, got {beats}");

    // no more ticks arrive once the agent is gone
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ticks_of(&log, "beat").len(), beats);
}
