//! Blackboard behavior observable from outside an agent: the cross-agent
//! shared segment, write ordering, and change metadata.

mod common;

use async_trait::async_trait;
use common::*;
use thicket::action::{ActionHandler, HandlerError, TickCtx};
use thicket::prelude::*;

/// Writes one shared and one private note, then succeeds.
struct Announce;

#[async_trait]
impl ActionHandler for Announce {
    async fn on_tick(&mut self, ctx: &TickCtx) -> Result<Status, HandlerError> {
        ctx.blackboard
            .put(BlackboardKey::shared("alarm"), "raised")
            .await;
        ctx.blackboard.put("note", "private").await;
        Ok(Status::Success)
    }
}

/// Counts up a key with three writes in program order.
struct CountUp;

#[async_trait]
impl ActionHandler for CountUp {
    async fn on_tick(&mut self, ctx: &TickCtx) -> Result<Status, HandlerError> {
        for value in 1..=3 {
            ctx.blackboard.put("counter", value).await;
        }
        Ok(Status::Success)
    }
}

fn registry() -> ActionRegistry {
    let log = new_log();
    let mut registry = scripted_registry(&log);
    registry.register("announce", |_params| {
        Ok(Box::new(Announce) as Box<dyn ActionHandler>)
    });
    registry.register("count_up", |_params| {
        Ok(Box::new(CountUp) as Box<dyn ActionHandler>)
    });
    registry
}

/// Agents in a population share exactly the shared segment; everything else
/// stays in their own namespace.
#[tokio::test]
async fn shared_segment_crosses_agents_private_keys_do_not() {
    let mut population = Population::new(registry());
    population
        .spawn(AgentSpec::manual("writer", NodeSpec::action("announce")))
        .await
        .unwrap();
    population
        .spawn(AgentSpec::manual("reader", scripted("idle", &["success"])))
        .await
        .unwrap();

    let reader_bb = population.agent("reader").unwrap().blackboard();
    let mut changes = reader_bb
        .subscribe(Pattern::Key(BlackboardKey::shared("alarm")))
        .await;

    let writer = population.agent("writer").unwrap();
    assert_eq!(writer.tick().await.unwrap(), Status::Success);

    assert_eq!(
        reader_bb.get(BlackboardKey::shared("alarm")).await,
        Some(serde_json::json!("raised")),
        "shared-segment writes must be visible across agents"
    );
    assert_eq!(
        reader_bb.get("note").await,
        None,
        "private keys must not leak between agents"
    );
    assert_eq!(
        writer.blackboard().get("note").await,
        Some(serde_json::json!("private"))
    );

    // the change a subscriber sees carries the writer's identity
    let change = changes.recv().await.unwrap();
    assert_eq!(change.key, BlackboardKey::shared("alarm"));
    assert_eq!(change.op, ChangeOp::Put);
    assert_eq!(change.origin.as_str(), "writer");

    population.shutdown().await;
}

/// Writes from one origin are observed in program order.
#[tokio::test]
async fn writes_from_one_origin_arrive_in_program_order() {
    let registry = registry();
    let agent = Agent::spawn(
        AgentSpec::manual("counter", NodeSpec::action("count_up")),
        &registry,
    )
    .await
    .unwrap();

    let mut changes = agent
        .blackboard()
        .subscribe(Pattern::Key(BlackboardKey::named("counter")))
        .await;

    agent.tick().await.unwrap();

    for expected in 1..=3 {
        let change = changes.recv().await.unwrap();
        assert_eq!(change.new, Some(serde_json::json!(expected)));
    }
    assert_eq!(
        agent.blackboard().get("counter").await,
        Some(serde_json::json!(3)),
        "last writer wins"
    );
    agent.shutdown().await;
}

/// Population bookkeeping: agents are addressable by id and terminate
/// individually.
#[tokio::test]
async fn population_tracks_and_terminates_agents() {
    let mut population = Population::new(registry());
    population
        .spawn(AgentSpec::manual("one", scripted("idle", &["success"])))
        .await
        .unwrap();
    population
        .spawn(AgentSpec::manual("two", scripted("idle", &["success"])))
        .await
        .unwrap();
    assert_eq!(population.len(), 2);

    let duplicate = population
        .spawn(AgentSpec::manual("one", scripted("idle", &["success"])))
        .await;
    assert!(duplicate.is_err(), "duplicate agent ids are rejected");

    assert!(population.terminate("one").await);
    assert!(!population.terminate("one").await);
    assert!(population.agent("one").is_none());
    assert_eq!(population.len(), 1);

    population.shutdown().await;
}
