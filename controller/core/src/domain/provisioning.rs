// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Provisioning Listener Contract
//!
//! Listeners observe, and may veto, the two-phase lifecycle of a
//! [`PlannedResource`]:
//!
//! ```text
//! can_provision ─▶ on_started ─▶ on_complete ─▶ on_commit
//!                             │              └▶ on_rollback
//!                             └▶ on_failure
//! ```
//!
//! Every callback has a no-op default so a listener implements only the
//! phases it cares about. Notification callbacks return `anyhow::Result`;
//! an error (or panic) from one listener is reported and isolated, it never
//! prevents delivery to the remaining listeners.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::agent::{AgentName, AgentNode};
use crate::domain::cloud::{CauseOfBlockage, Cloud, Label, LaunchError, PlannedResource, PlannedResourceId};
use crate::domain::registry::RegistryError;

pub trait ProvisioningListener: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Return a cause to veto the request. The first veto wins.
    fn can_provision(
        &self,
        _cloud: &dyn Cloud,
        _label: Option<&Label>,
        _num_executors: u32,
    ) -> Option<CauseOfBlockage> {
        None
    }

    fn on_started(
        &self,
        _cloud: &dyn Cloud,
        _label: Option<&Label>,
        _planned: &[PlannedResource],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_complete(&self, _planned: &PlannedResource, _agent: &AgentNode) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_commit(&self, _planned: &PlannedResource, _agent: &AgentNode) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_failure(&self, _planned: &PlannedResource, _cause: &LaunchError) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_rollback(
        &self,
        _planned: &PlannedResource,
        _agent: &AgentNode,
        _cause: &RegistryError,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifecycle phase a listener was being notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPhase {
    Started,
    Complete,
    Commit,
    Failure,
    Rollback,
}

impl std::fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Complete => "complete",
            Self::Commit => "commit",
            Self::Failure => "failure",
            Self::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningError {
    #[error("provisioning on cloud '{cloud}' blocked by {cause}")]
    ProvisioningBlocked { cloud: String, cause: CauseOfBlockage },

    #[error("planned resource '{resource}' failed: {reason}")]
    ProvisioningFutureFailed { resource: String, reason: String },

    #[error("cloud '{cloud}' refused to plan resources: {reason}")]
    CloudRefused { cloud: String, reason: String },

    #[error("listener '{listener}' failed during {phase}: {reason}")]
    ListenerNotificationFailed {
        listener: String,
        phase: ProvisioningPhase,
        reason: String,
    },
}

/// Terminal state of one planned resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// The agent is now live in the cluster registry.
    Committed(AgentName),
    /// The agent launched but could not be registered.
    RolledBack { agent: AgentName, cause: RegistryError },
    /// The launch future failed or timed out; no agent exists.
    Failed(ProvisioningError),
}

/// Result of driving one planned resource to its terminal state.
#[derive(Debug, Clone)]
pub struct ProvisioningReport {
    pub planned: PlannedResourceId,
    pub display_name: String,
    pub outcome: ProvisioningOutcome,
    /// Isolated listener failures collected along the way.
    pub notification_failures: Vec<ProvisioningError>,
}

impl ProvisioningReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, ProvisioningOutcome::Committed(_))
    }
}
