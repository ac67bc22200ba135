#![allow(dead_code)]

//! Shared scripted actions for driving trees deterministically in tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thicket::action::Parameters;
use thicket::prelude::*;

/// Everything the scripted actions saw, in the order they saw it.
pub type RunLog = Arc<Mutex<Vec<LogEntry>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Ticked { name: String, status: Status },
    Terminated { name: String, status: Status },
}

pub fn new_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Names of ticked actions, in execution order.
pub fn tick_order(log: &RunLog) -> Vec<String> {
    log.lock()
        .iter()
        .filter_map(|entry| match entry {
            LogEntry::Ticked { name, .. } => Some(name.clone()),
            LogEntry::Terminated { .. } => None,
        })
        .collect()
}

/// Statuses one action returned, in order.
pub fn ticks_of(log: &RunLog, name: &str) -> Vec<Status> {
    log.lock()
        .iter()
        .filter_map(|entry| match entry {
            LogEntry::Ticked {
                name: ticked,
                status,
            } if ticked == name => Some(*status),
            _ => None,
        })
        .collect()
}

/// Terminal statuses one action's handler was given, in order.
pub fn terminations_of(log: &RunLog, name: &str) -> Vec<Status> {
    log.lock()
        .iter()
        .filter_map(|entry| match entry {
            LogEntry::Terminated {
                name: terminated,
                status,
            } if terminated == name => Some(*status),
            _ => None,
        })
        .collect()
}

/// Returns the statuses in its script one tick at a time, repeating the last
/// one forever, and logs everything it is told.
pub struct Scripted {
    name: String,
    script: Vec<Status>,
    step: usize,
    log: RunLog,
}

#[async_trait]
impl ActionHandler for Scripted {
    async fn on_tick(&mut self, _ctx: &TickCtx) -> Result<Status, HandlerError> {
        let status = *self
            .script
            .get(self.step)
            .or_else(|| self.script.last())
            .unwrap();
        self.step += 1;
        self.log.lock().push(LogEntry::Ticked {
            name: self.name.clone(),
            status,
        });
        Ok(status)
    }

    async fn on_terminate(&mut self, final_status: Status) {
        self.log.lock().push(LogEntry::Terminated {
            name: self.name.clone(),
            status: final_status,
        });
    }
}

fn parse_status(word: &str) -> Status {
    match word {
        "success" => Status::Success,
        "failure" => Status::Failure,
        "running" => Status::Running,
        other => panic!("unknown scripted status {other:?}"),
    }
}

/// A registry with a `"scripted"` handler whose `name` and `script`
/// parameters come from the node description.
pub fn scripted_registry(log: &RunLog) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    let log = log.clone();
    registry.register("scripted", move |params: &Parameters| {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("anonymous")
            .to_string();
        let script = params
            .get("script")
            .and_then(|v| v.as_array())
            .map(|steps| {
                steps
                    .iter()
                    .map(|step| parse_status(step.as_str().unwrap()))
                    .collect()
            })
            .unwrap_or_else(|| vec![Status::Success]);
        Ok(Box::new(Scripted {
            name,
            script,
            step: 0,
            log: log.clone(),
        }) as Box<dyn ActionHandler>)
    });
    registry
}

/// A `"scripted"` action node.
pub fn scripted(name: &str, script: &[&str]) -> NodeSpec {
    let params = serde_json::json!({ "name": name, "script": script });
    NodeSpec::action_with("scripted", params.as_object().cloned().unwrap())
}
