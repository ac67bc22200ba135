/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Declarative tree descriptions
//!
//! An agent is described by an [`AgentSpec`]: identity, timing knobs and a
//! tree of [`NodeSpec`]s. Descriptions are plain serde data, so they can be
//! written in code through the constructor helpers or loaded from JSON.
//!
//! [`compile`] validates a description against an
//! [`ActionRegistry`](crate::action::ActionRegistry) and lowers it into an
//! immutable [`Blueprint`]: ids assigned, parameters parsed, action factories
//! resolved (and probed once, so a handler that cannot be built fails the
//! agent at start rather than mid-run). Supervisors keep the blueprint around
//! to rebuild any part of the tree that crashes past its restart budget.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{ActionFactory, ActionRegistry, Parameters};
use crate::blackboard::BlackboardKey;
use crate::node::NodeId;
use crate::{ThicketError, ThicketResult};

pub const BEHAVIOR_TREE_TYPE: &str = "behavior_tree";

fn default_agent_type() -> String {
    BEHAVIOR_TREE_TYPE.to_string()
}
fn default_tick_freq_ms() -> u64 {
    50
}
fn default_tick_deadline_ms() -> u64 {
    10_000
}
fn default_max_restarts() -> u32 {
    5
}
fn default_max_restart_window_s() -> u64 {
    3600
}
fn default_shutdown_timeout_ms() -> u64 {
    5000
}
fn default_max_handler_errors() -> u32 {
    5
}

/// Everything needed to run one agent. Unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Only `behavior_tree` is supported.
    #[serde(rename = "type", default = "default_agent_type")]
    pub agent_type: String,

    /// Scheduler period. `0` disables the scheduler; the host drives the
    /// agent through [`AgentHandle::tick`](crate::agent::AgentHandle::tick).
    #[serde(default = "default_tick_freq_ms")]
    pub tick_freq_ms: u64,

    /// Budget for one whole root-to-leaf tick.
    #[serde(default = "default_tick_deadline_ms")]
    pub tick_deadline_ms: u64,

    /// Worker restart budget per node within the window below; exceeding it
    /// escalates to a subtree rebuild.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_max_restart_window_s")]
    pub max_restart_window_s: u64,

    /// Grace period for depth-first termination at shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Consecutive action handler errors before the agent shuts itself down.
    #[serde(default = "default_max_handler_errors")]
    pub max_handler_errors: u32,

    pub root: NodeSpec,
}

impl AgentSpec {
    /// A spec with every knob at its default.
    pub fn new(id: impl Into<String>, root: NodeSpec) -> Self {
        Self {
            id: id.into(),
            name: None,
            agent_type: default_agent_type(),
            tick_freq_ms: default_tick_freq_ms(),
            tick_deadline_ms: default_tick_deadline_ms(),
            max_restarts: default_max_restarts(),
            max_restart_window_s: default_max_restart_window_s(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_handler_errors: default_max_handler_errors(),
            root,
        }
    }

    /// Same as [`AgentSpec::new`] but with the scheduler disabled, for agents
    /// the host ticks by hand.
    pub fn manual(id: impl Into<String>, root: NodeSpec) -> Self {
        let mut spec = Self::new(id, root);
        spec.tick_freq_ms = 0;
        spec
    }

    pub fn from_json(json: &str) -> ThicketResult<Self> {
        serde_json::from_str(json).map_err(|e| ThicketError::Spec(e.to_string()))
    }

    pub fn tick_freq(&self) -> Option<Duration> {
        (self.tick_freq_ms > 0).then(|| Duration::from_millis(self.tick_freq_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoratorVariant {
    Inverter,
    Repeater,
    Timeout,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeVariant {
    Sequence,
    Selector,
    Parallel,
    SequenceWithMemory,
}

/// One node of a tree description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum NodeSpec {
    Action {
        /// Name of a factory in the [`ActionRegistry`]
        handler: String,
        #[serde(default)]
        parameters: Parameters,
    },
    Decorator {
        variant: DecoratorVariant,
        #[serde(default)]
        parameters: Parameters,
        child: Box<NodeSpec>,
    },
    Composite {
        variant: CompositeVariant,
        #[serde(default)]
        parameters: Parameters,
        children: Vec<NodeSpec>,
    },
}

impl NodeSpec {
    pub fn action(handler: impl Into<String>) -> Self {
        Self::action_with(handler, Parameters::default())
    }

    pub fn action_with(handler: impl Into<String>, parameters: Parameters) -> Self {
        NodeSpec::Action {
            handler: handler.into(),
            parameters,
        }
    }

    pub fn sequence(children: impl IntoIterator<Item = NodeSpec>) -> Self {
        Self::composite(CompositeVariant::Sequence, Parameters::default(), children)
    }

    pub fn selector(children: impl IntoIterator<Item = NodeSpec>) -> Self {
        Self::composite(CompositeVariant::Selector, Parameters::default(), children)
    }

    pub fn sequence_with_memory(children: impl IntoIterator<Item = NodeSpec>) -> Self {
        Self::composite(
            CompositeVariant::SequenceWithMemory,
            Parameters::default(),
            children,
        )
    }

    pub fn parallel(
        success_threshold: usize,
        failure_threshold: usize,
        children: impl IntoIterator<Item = NodeSpec>,
    ) -> Self {
        let mut parameters = Parameters::default();
        parameters.insert("success_threshold".into(), success_threshold.into());
        parameters.insert("failure_threshold".into(), failure_threshold.into());
        Self::composite(CompositeVariant::Parallel, parameters, children)
    }

    pub fn inverter(child: NodeSpec) -> Self {
        Self::decorator(DecoratorVariant::Inverter, Parameters::default(), child)
    }

    /// Repeat `count` successful runs of the child (`None` repeats forever).
    pub fn repeater(count: Option<u64>, child: NodeSpec) -> Self {
        let mut parameters = Parameters::default();
        if let Some(count) = count {
            parameters.insert("count".into(), count.into());
        }
        Self::decorator(DecoratorVariant::Repeater, parameters, child)
    }

    /// Repeat the child until it fails, then succeed.
    pub fn repeat_until_fail(child: NodeSpec) -> Self {
        let mut parameters = Parameters::default();
        parameters.insert("until_fail".into(), true.into());
        Self::decorator(DecoratorVariant::Repeater, parameters, child)
    }

    pub fn timeout(duration_ms: u64, child: NodeSpec) -> Self {
        let mut parameters = Parameters::default();
        parameters.insert("duration_ms".into(), duration_ms.into());
        Self::decorator(DecoratorVariant::Timeout, parameters, child)
    }

    pub fn conditional(
        key: impl Into<BlackboardKey>,
        expected: impl Into<Value>,
        invert: bool,
        child: NodeSpec,
    ) -> Self {
        let key: BlackboardKey = key.into();
        let mut parameters = Parameters::default();
        parameters.insert(
            "key".into(),
            serde_json::to_value(key).unwrap_or(Value::Null),
        );
        parameters.insert("expected".into(), expected.into());
        if invert {
            parameters.insert("invert".into(), true.into());
        }
        Self::decorator(DecoratorVariant::Conditional, parameters, child)
    }

    pub fn decorator(variant: DecoratorVariant, parameters: Parameters, child: NodeSpec) -> Self {
        NodeSpec::Decorator {
            variant,
            parameters,
            child: Box::new(child),
        }
    }

    pub fn composite(
        variant: CompositeVariant,
        parameters: Parameters,
        children: impl IntoIterator<Item = NodeSpec>,
    ) -> Self {
        NodeSpec::Composite {
            variant,
            parameters,
            children: children.into_iter().collect(),
        }
    }
}

/* --- Compilation --- */

/// A validated, immutable lowering of an [`AgentSpec`]'s tree. Shared with
/// every supervisor so crashed subtrees can be rebuilt from it.
#[derive(Clone, Debug)]
pub(crate) struct Blueprint {
    pub root: Arc<NodeBlueprint>,
    pub node_count: usize,
}

pub(crate) struct NodeBlueprint {
    pub id: NodeId,
    pub kind: BlueprintKind,
    pub children: Vec<Arc<NodeBlueprint>>,
    /// Human-readable tag for logs and dot output
    pub label: String,
}

impl std::fmt::Debug for NodeBlueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBlueprint")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("children", &self.children)
            .field("label", &self.label)
            .finish()
    }
}

pub(crate) enum BlueprintKind {
    Action {
        factory: ActionFactory,
        parameters: Parameters,
    },
    Decorator(DecoratorVariant, DecoratorParams),
    Composite(CompositeVariant, CompositeParams),
}

impl std::fmt::Debug for BlueprintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlueprintKind::Action { parameters, .. } => f
                .debug_struct("Action")
                .field("factory", &"<factory fn>")
                .field("parameters", parameters)
                .finish(),
            BlueprintKind::Decorator(variant, params) => {
                f.debug_tuple("Decorator").field(variant).field(params).finish()
            }
            BlueprintKind::Composite(variant, params) => {
                f.debug_tuple("Composite").field(variant).field(params).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DecoratorParams {
    Inverter,
    Repeater { count: Option<u64>, until_fail: bool },
    Timeout { duration: Duration },
    Conditional { key: BlackboardKey, expected: Value, invert: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompositeParams {
    Plain,
    Parallel {
        success_threshold: usize,
        failure_threshold: usize,
    },
}

/// Validate `spec` against `registry` and lower it into a [`Blueprint`].
pub(crate) fn compile(spec: &AgentSpec, registry: &ActionRegistry) -> ThicketResult<Blueprint> {
    if spec.agent_type != BEHAVIOR_TREE_TYPE {
        return Err(ThicketError::UnsupportedAgentType(spec.agent_type.clone()));
    }
    let mut next_id = 0usize;
    let root = compile_node(&spec.root, "root", &mut next_id, registry)?;
    Ok(Blueprint {
        root,
        node_count: next_id,
    })
}

fn compile_node(
    spec: &NodeSpec,
    path: &str,
    next_id: &mut usize,
    registry: &ActionRegistry,
) -> ThicketResult<Arc<NodeBlueprint>> {
    let id = NodeId::from(*next_id);
    *next_id += 1;

    let blueprint = match spec {
        NodeSpec::Action {
            handler,
            parameters,
        } => {
            let factory = registry
                .factory(handler)
                .ok_or_else(|| ThicketError::UnknownHandler(handler.clone()))?;
            // probe once so a handler that cannot be built is a start-time
            // failure, not a crash loop
            factory(parameters)?;
            NodeBlueprint {
                id,
                kind: BlueprintKind::Action {
                    factory,
                    parameters: parameters.clone(),
                },
                children: vec![],
                label: handler.clone(),
            }
        }
        NodeSpec::Decorator {
            variant,
            parameters,
            child,
        } => {
            let params = parse_decorator(*variant, parameters, path)?;
            let child = compile_node(child, &format!("{path}/child"), next_id, registry)?;
            NodeBlueprint {
                id,
                kind: BlueprintKind::Decorator(*variant, params),
                children: vec![child],
                label: format!("{variant:?}"),
            }
        }
        NodeSpec::Composite {
            variant,
            parameters,
            children,
        } => {
            if children.is_empty() {
                return Err(ThicketError::EmptyComposite(path.to_string()));
            }
            let params = parse_composite(*variant, parameters, children.len(), path)?;
            let children = children
                .iter()
                .enumerate()
                .map(|(i, child)| {
                    compile_node(child, &format!("{path}/children[{i}]"), next_id, registry)
                })
                .collect::<ThicketResult<Vec<_>>>()?;
            NodeBlueprint {
                id,
                kind: BlueprintKind::Composite(*variant, params),
                children,
                label: format!("{variant:?}"),
            }
        }
    };
    Ok(Arc::new(blueprint))
}

fn parse_decorator(
    variant: DecoratorVariant,
    parameters: &Parameters,
    path: &str,
) -> ThicketResult<DecoratorParams> {
    Ok(match variant {
        DecoratorVariant::Inverter => DecoratorParams::Inverter,
        DecoratorVariant::Repeater => {
            let count = opt_u64(parameters, "count", path)?;
            if count == Some(0) {
                return Err(invalid(path, "repeater count must be at least 1"));
            }
            DecoratorParams::Repeater {
                count,
                until_fail: opt_bool(parameters, "until_fail", path)?.unwrap_or(false),
            }
        }
        DecoratorVariant::Timeout => {
            let duration_ms = opt_u64(parameters, "duration_ms", path)?
                .ok_or_else(|| invalid(path, "timeout requires duration_ms"))?;
            DecoratorParams::Timeout {
                duration: Duration::from_millis(duration_ms),
            }
        }
        DecoratorVariant::Conditional => {
            let key = match parameters.get("key") {
                None => return Err(invalid(path, "conditional requires key")),
                Some(Value::String(name)) => BlackboardKey::named(name.clone()),
                Some(other) => serde_json::from_value(other.clone())
                    .map_err(|e| invalid(path, format!("conditional key: {e}")))?,
            };
            let expected = parameters
                .get("expected")
                .cloned()
                .ok_or_else(|| invalid(path, "conditional requires expected"))?;
            DecoratorParams::Conditional {
                key,
                expected,
                invert: opt_bool(parameters, "invert", path)?.unwrap_or(false),
            }
        }
    })
}

fn parse_composite(
    variant: CompositeVariant,
    parameters: &Parameters,
    child_count: usize,
    path: &str,
) -> ThicketResult<CompositeParams> {
    if variant != CompositeVariant::Parallel {
        return Ok(CompositeParams::Plain);
    }
    let success = opt_u64(parameters, "success_threshold", path)?
        .ok_or_else(|| invalid(path, "parallel requires success_threshold"))?
        as usize;
    let failure = opt_u64(parameters, "failure_threshold", path)?
        .ok_or_else(|| invalid(path, "parallel requires failure_threshold"))?
        as usize;
    if success == 0 || failure == 0 || success + failure <= child_count {
        return Err(ThicketError::InvalidThresholds {
            at: path.to_string(),
            success,
            failure,
            children: child_count,
        });
    }
    Ok(CompositeParams::Parallel {
        success_threshold: success,
        failure_threshold: failure,
    })
}

fn invalid(path: &str, message: impl Into<String>) -> ThicketError {
    ThicketError::InvalidParameters {
        at: path.to_string(),
        message: message.into(),
    }
}

fn opt_u64(parameters: &Parameters, name: &str, path: &str) -> ThicketResult<Option<u64>> {
    match parameters.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(path, format!("{name} must be a non-negative integer"))),
    }
}

fn opt_bool(parameters: &Parameters, name: &str, path: &str) -> ThicketResult<Option<bool>> {
    match parameters.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(path, format!("{name} must be a boolean"))),
    }
}
