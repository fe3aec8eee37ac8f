// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cluster Registry Interface
//!
//! The registry maps agent names to [`AgentNode`] records. It is the only
//! cluster-wide mutable state this crate touches. The in-memory
//! implementation lives in `crate::infrastructure::registry`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::agent::{AgentName, AgentNode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("agent '{0}' is already registered")]
    NameCollision(AgentName),

    #[error("registry capacity of {0} agents exceeded")]
    CapacityExceeded(usize),

    #[error("agent '{0}' not found")]
    NotFound(AgentName),
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn lookup_agent(&self, name: &AgentName) -> Option<Arc<AgentNode>>;

    /// Add `agent` to the live cluster. Fails on name collision or when full.
    async fn register_agent(&self, agent: Arc<AgentNode>) -> Result<(), RegistryError>;

    async fn remove_agent(&self, name: &AgentName) -> Result<Arc<AgentNode>, RegistryError>;

    async fn list_agents(&self) -> Vec<Arc<AgentNode>>;
}
