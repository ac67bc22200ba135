//! # Populations
//!
//! A population runs many agents side by side and owns the one store behind
//! the cross-agent [`SHARED_SEGMENT`](crate::blackboard::SHARED_SEGMENT).
//! Agents spawned through a population can trade state through keys in that
//! segment; everything else stays in their private namespaces.

use crate::action::ActionRegistry;
use crate::agent::{self, AgentHandle};
use crate::blackboard::{spawn_store, StoreHandle};
use crate::config::AgentSpec;
use crate::{ThicketError, ThicketResult};

pub struct Population {
    registry: ActionRegistry,
    shared_store: StoreHandle,
    agents: ahash::HashMap<String, AgentHandle>,
}

impl Population {
    /// Must be called from within a tokio runtime; the shared store task is
    /// spawned here.
    pub fn new(registry: ActionRegistry) -> Self {
        Self {
            registry,
            shared_store: spawn_store(),
            agents: ahash::HashMap::default(),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ActionRegistry {
        &mut self.registry
    }

    /// Spawn an agent wired into the population's shared blackboard segment.
    /// Agent ids are unique within a population.
    pub async fn spawn(&mut self, spec: AgentSpec) -> ThicketResult<&AgentHandle> {
        if self.agents.contains_key(&spec.id) {
            return Err(ThicketError::Spec(format!(
                "duplicate agent id {:?}",
                spec.id
            )));
        }
        let id = spec.id.clone();
        let handle =
            agent::spawn_with(spec, &self.registry, Some(self.shared_store.clone())).await?;
        Ok(self.agents.entry(id).or_insert(handle))
    }

    pub fn agent(&self, id: &str) -> Option<&AgentHandle> {
        self.agents.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentHandle> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Terminate one agent. Returns `false` if no agent has that id.
    pub async fn terminate(&mut self, id: &str) -> bool {
        match self.agents.remove(id) {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Terminate every agent, then drop the shared store.
    pub async fn shutdown(mut self) {
        for (_, handle) in self.agents.drain() {
            handle.shutdown().await;
        }
    }
}
