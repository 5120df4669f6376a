use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use strand_core::traits::ToolRegistration;

use crate::agent::Agent;
use crate::hooks::HookPipeline;

/// Agents in registration order. Re-registering an id replaces the agent in
/// place, silently, keeping its position. Tool search depends on the order.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self { agents: Vec::new() }
    }

    pub fn insert(&mut self, agent: Arc<Agent>) {
        if let Some(existing) = self.agents.iter_mut().find(|a| a.id() == agent.id()) {
            *existing = agent;
        } else {
            self.agents.push(agent);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Agent>> {
        let pos = self.agents.iter().position(|a| a.id() == id)?;
        Some(self.agents.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Registration-order snapshot; the `Arc`s still point at the live
    /// agents (tool registries included).
    pub fn snapshot(&self) -> Vec<Arc<Agent>> {
        self.agents.clone()
    }
}

/// Per-execution environment threaded through workflow and step execution:
/// an agent snapshot, the hook pipeline, and the execution's cancellation
/// token.
#[derive(Clone)]
pub struct ExecEnv {
    pub agents: Vec<Arc<Agent>>,
    pub hooks: Arc<HookPipeline>,
    pub cancel: CancellationToken,
}

impl ExecEnv {
    pub fn new(agents: Vec<Arc<Agent>>, hooks: Arc<HookPipeline>, cancel: CancellationToken) -> Self {
        Self {
            agents,
            hooks,
            cancel,
        }
    }

    pub fn agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.id() == id).cloned()
    }

    /// Search every agent's tool registry in registration order; first
    /// match wins.
    pub async fn find_tool(&self, name: &str) -> Option<(Arc<Agent>, ToolRegistration)> {
        for agent in &self.agents {
            if let Some(tool) = agent.tool(name).await {
                return Some((agent.clone(), tool));
            }
        }
        None
    }
}
