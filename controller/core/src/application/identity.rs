// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Identity & Launcher Validation
//!
//! Resolves a claimed identity against the cluster registry and confirms that
//! the agent's launcher chain terminates in a launcher that expects inbound
//! network connections. Delegating launchers are unwrapped through
//! [`Launcher::inner`] up to a fixed depth; a chain deeper than that is
//! always rejected, regardless of policy, since it is indistinguishable from
//! a cycle.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::agent::{AgentName, AgentNode};
use crate::domain::connection::AdmissionError;
use crate::domain::launcher::{Launcher, LauncherKind, LauncherPolicy, DEFAULT_MAX_LAUNCHER_DEPTH};
use crate::domain::registry::AgentRegistry;

/// Successful launcher validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherValidation {
    /// Display name of the launcher the walk stopped at.
    pub terminal: String,
    /// Number of links visited, including the terminal one.
    pub depth: usize,
    /// True when the chain never reached a network launcher and the lenient
    /// policy let it through anyway.
    pub lenient_fallback: bool,
}

pub struct AgentIdentityValidator {
    registry: Arc<dyn AgentRegistry>,
    policy: LauncherPolicy,
    max_depth: usize,
}

impl AgentIdentityValidator {
    pub fn new(registry: Arc<dyn AgentRegistry>) -> Self {
        Self {
            registry,
            policy: LauncherPolicy::default(),
            max_depth: DEFAULT_MAX_LAUNCHER_DEPTH,
        }
    }

    pub fn with_policy(mut self, policy: LauncherPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn policy(&self) -> LauncherPolicy {
        self.policy
    }

    /// True iff an agent with that identity is registered.
    pub async fn owns(&self, claim: &AgentName) -> bool {
        self.registry.lookup_agent(claim).await.is_some()
    }

    pub async fn resolve(&self, claim: &AgentName) -> Result<Arc<AgentNode>, AdmissionError> {
        self.registry
            .lookup_agent(claim)
            .await
            .ok_or_else(|| AdmissionError::UnknownIdentity(claim.to_string()))
    }

    pub fn validate_launcher_chain(&self, agent: &AgentNode) -> Result<LauncherValidation, AdmissionError> {
        let mut current: &dyn Launcher = agent.launcher().as_ref();
        let mut depth = 1;

        loop {
            if current.kind() == LauncherKind::NetworkAgent {
                debug!(agent = %agent.name(), depth, terminal = %current.display_name(), "Launcher chain accepted");
                return Ok(LauncherValidation {
                    terminal: current.display_name(),
                    depth,
                    lenient_fallback: false,
                });
            }

            match current.inner() {
                Some(inner) if depth < self.max_depth => {
                    current = inner;
                    depth += 1;
                }
                Some(_) => {
                    return Err(AdmissionError::LauncherChainMismatch {
                        agent: agent.name().to_string(),
                        detail: format!(
                            "delegation is deeper than {} links: {}",
                            self.max_depth,
                            agent.launcher_chain(self.max_depth).join(" -> ")
                        ),
                    });
                }
                None => break,
            }
        }

        let chain = agent.launcher_chain(self.max_depth).join(" -> ");
        match self.policy {
            LauncherPolicy::Strict => Err(AdmissionError::LauncherChainMismatch {
                agent: agent.name().to_string(),
                detail: format!(
                    "chain {} ends at '{}' ({:?}) without reaching a network agent launcher",
                    chain,
                    current.display_name(),
                    current.kind()
                ),
            }),
            LauncherPolicy::Lenient => {
                warn!(
                    agent = %agent.name(),
                    chain = %chain,
                    "Launcher chain does not end in a network agent launcher; accepting under lenient policy"
                );
                Ok(LauncherValidation {
                    terminal: current.display_name(),
                    depth,
                    lenient_fallback: true,
                })
            }
        }
    }
}
