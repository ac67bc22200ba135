//! Utilities for generating pretty dotgraphs

use graphviz_rust::dot_generator::*;
use graphviz_rust::dot_structures::*;
use graphviz_rust::printer::DotPrinter;
use graphviz_rust::printer::PrinterContext;

use crate::agent::AgentHandle;
use crate::config::{BlueprintKind, CompositeVariant, DecoratorVariant, NodeBlueprint};

pub const SEQUENCE_SYMBOL: &str = "➡";
pub const SELECTOR_SYMBOL: &str = "?";
pub const PARALLEL_SYMBOL: &str = "⇉";
pub const MEMORY_SYMBOL: &str = "➡*";
pub const LOOP_SYMBOL: &str = "↺";
pub const INVERT_SYMBOL: &str = "!";
pub const TIMEOUT_SYMBOL: &str = "⏲";
pub const GATE_SYMBOL: &str = "δ";

impl AgentHandle {
    /// Saves the compiled tree to `out/[name].dot`.
    pub fn save_dot(&self, name: &str) {
        let dot = self.dot_string();

        std::fs::create_dir_all("out").unwrap();

        let path = format!("out/{name}.dot");

        std::fs::write(&path, dot).unwrap();
    }

    pub fn dot_string(&self) -> String {
        let mut ctx = PrinterContext::default();
        self.graphviz_graph().print(&mut ctx)
    }

    /// Get the [`graphviz_rust::Graph`] representation of the compiled tree.
    /// Statuses live inside the node tasks, so this is topology only.
    pub fn graphviz_graph(&self) -> Graph {
        let mut to_visit = vec![&self.blueprint().root];
        let mut stmts = vec![];

        while let Some(blueprint) = to_visit.pop() {
            let parent_node = blueprint_node(blueprint);
            let parent_id = parent_node.id.clone();
            stmts.push(stmt!(parent_node));

            for child in &blueprint.children {
                to_visit.push(child);
                let child_node = blueprint_node(child);
                let child_id = child_node.id.clone();
                let parent_id = parent_id.clone();

                let edge_attrs = vec![attr!("arrowhead", "vee")];
                let edge = edge!(parent_id => child_id, edge_attrs);
                stmts.push(stmt!(child_node));
                stmts.push(stmt!(edge));
            }
        }

        Graph::DiGraph {
            id: id!("BehaviorTree"),
            strict: true,
            stmts,
        }
    }
}

fn blueprint_node(blueprint: &NodeBlueprint) -> Node {
    let id = format!("\"Node{}\"", blueprint.id.index());
    let mut attrs = vec![attr!("penwidth", "2.0")];

    match &blueprint.kind {
        BlueprintKind::Action { .. } => {
            let label = format!("\"{}\"", blueprint.label);
            attrs.push(attr!("shape", "box"));
            attrs.push(attr!("label", label));
        }
        BlueprintKind::Decorator(variant, _) => {
            let symbol = match variant {
                DecoratorVariant::Inverter => INVERT_SYMBOL,
                DecoratorVariant::Repeater => LOOP_SYMBOL,
                DecoratorVariant::Timeout => TIMEOUT_SYMBOL,
                DecoratorVariant::Conditional => GATE_SYMBOL,
            };
            let label = format!("\"{symbol}\"");
            let tip = format!("\"{}\"", blueprint.label);
            attrs.push(attr!("shape", "square"));
            attrs.push(attr!("label", label));
            attrs.push(attr!("tooltip", tip));
        }
        BlueprintKind::Composite(variant, _) => {
            let symbol = match variant {
                CompositeVariant::Sequence => SEQUENCE_SYMBOL,
                CompositeVariant::Selector => SELECTOR_SYMBOL,
                CompositeVariant::Parallel => PARALLEL_SYMBOL,
                CompositeVariant::SequenceWithMemory => MEMORY_SYMBOL,
            };
            let label = format!("\"{symbol}\"");
            let tip = format!("\"{}\"", blueprint.label);
            attrs.push(attr!("shape", "square"));
            attrs.push(attr!("label", label));
            attrs.push(attr!("tooltip", tip));
        }
    }

    node!(id, attrs)
}
