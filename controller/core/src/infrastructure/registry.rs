// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory cluster registry.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Thread-safe name → agent map behind the `AgentRegistry` port
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::agent::{AgentName, AgentNode};
use crate::domain::registry::{AgentRegistry, RegistryError};

#[derive(Clone, Default)]
pub struct InMemoryAgentRegistry {
    agents: Arc<RwLock<BTreeMap<AgentName, Arc<AgentNode>>>>,
    capacity: Option<usize>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that refuses registrations beyond `capacity` agents.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            agents: Arc::default(),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn lookup_agent(&self, name: &AgentName) -> Option<Arc<AgentNode>> {
        self.agents.read().get(name).cloned()
    }

    async fn register_agent(&self, agent: Arc<AgentNode>) -> Result<(), RegistryError> {
        let mut agents = self.agents.write();
        if agents.contains_key(agent.name()) {
            return Err(RegistryError::NameCollision(agent.name().clone()));
        }
        if let Some(capacity) = self.capacity {
            if agents.len() >= capacity {
                return Err(RegistryError::CapacityExceeded(capacity));
            }
        }
        debug!(agent = %agent.name(), "Registering agent");
        agents.insert(agent.name().clone(), agent);
        Ok(())
    }

    async fn remove_agent(&self, name: &AgentName) -> Result<Arc<AgentNode>, RegistryError> {
        self.agents
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.clone()))
    }

    async fn list_agents(&self) -> Vec<Arc<AgentNode>> {
        self.agents.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::launcher::LauncherSpec;

    fn agent(name: &str) -> Arc<AgentNode> {
        Arc::new(AgentNode::new(name, Arc::new(LauncherSpec::network())))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = InMemoryAgentRegistry::new();
        registry.register_agent(agent("build-1")).await.unwrap();

        assert!(registry.lookup_agent(&AgentName::from("build-1")).await.is_some());
        assert!(registry.lookup_agent(&AgentName::from("build-2")).await.is_none());
        assert_eq!(
            registry.register_agent(agent("build-1")).await,
            Err(RegistryError::NameCollision(AgentName::from("build-1")))
        );
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let registry = InMemoryAgentRegistry::with_capacity(1);
        registry.register_agent(agent("a")).await.unwrap();
        assert_eq!(
            registry.register_agent(agent("b")).await,
            Err(RegistryError::CapacityExceeded(1))
        );

        registry.remove_agent(&AgentName::from("a")).await.unwrap();
        registry.register_agent(agent("b")).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_agent() {
        let registry = InMemoryAgentRegistry::new();
        assert!(matches!(
            registry.remove_agent(&AgentName::from("ghost")).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_name() {
        let registry = InMemoryAgentRegistry::new();
        registry.register_agent(agent("b")).await.unwrap();
        registry.register_agent(agent("a")).await.unwrap();
        let names: Vec<_> = registry.list_agents().await.iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
