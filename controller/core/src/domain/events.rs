// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentName;
use crate::domain::channel::ChannelId;
use crate::domain::cloud::PlannedResourceId;

/// Lifecycle of planned resources, one event per coordinator transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvisioningEvent {
    CapacityBlocked {
        cloud: String,
        label: Option<String>,
        cause: String,
        blocked_at: DateTime<Utc>,
    },
    ProvisioningStarted {
        cloud: String,
        label: Option<String>,
        planned: Vec<PlannedResourceId>,
        started_at: DateTime<Utc>,
    },
    ProvisioningCompleted {
        planned: PlannedResourceId,
        agent: AgentName,
        completed_at: DateTime<Utc>,
    },
    AgentCommitted {
        planned: PlannedResourceId,
        agent: AgentName,
        committed_at: DateTime<Utc>,
    },
    AgentRolledBack {
        planned: PlannedResourceId,
        agent: AgentName,
        cause: String,
        rolled_back_at: DateTime<Utc>,
    },
    ProvisioningFailed {
        planned: PlannedResourceId,
        cause: String,
        failed_at: DateTime<Utc>,
    },
}

/// Connection admission and channel lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    AgentConnected {
        agent: AgentName,
        channel: ChannelId,
        remote: Option<String>,
        connected_at: DateTime<Utc>,
    },
    AgentDisconnected {
        agent: AgentName,
        channel: ChannelId,
        cause: String,
        disconnected_at: DateTime<Utc>,
    },
    ConnectionRejected {
        claimed: Option<String>,
        remote: Option<String>,
        cause: String,
        rejected_at: DateTime<Utc>,
    },
    /// A stale channel was closed in favour of a reconnecting peer.
    ChannelPreempted {
        agent: AgentName,
        channel: ChannelId,
        preempted_at: DateTime<Utc>,
    },
}
