// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Receivers and Connection Hooks
//!
//! A receiver takes exclusive ownership of a connection attempt once it
//! claims the identity in [`AgentReceiver::owns`]. The dispatcher then drives
//! it through `after_properties → before_channel → after_channel`, with
//! every registered [`ConnectionHook`] invoked around it:
//!
//! | phase              | order              | hooks may reject |
//! |--------------------|--------------------|------------------|
//! | `after_properties` | hooks, receiver    | yes              |
//! | `before_channel`   | hooks, receiver    | yes              |
//! | `after_channel`    | receiver, hooks    | no               |
//!
//! `channel_closed` is called exactly once for every connection a receiver
//! owned, on success, rejection, failure and cancellation alike.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::application::channel_establisher::ChannelEstablisher;
use crate::application::identity::AgentIdentityValidator;
use crate::application::reconnection::{IdentityLease, ReconnectionController};
use crate::domain::agent::{AgentName, AgentNode};
use crate::domain::connection::{AdmissionError, CloseCause, ConnectionState};
use crate::domain::events::ConnectionEvent;
use crate::infrastructure::event_bus::EventBus;

#[async_trait]
pub trait AgentReceiver: Send + Sync {
    fn name(&self) -> &str;

    async fn owns(&self, identity: &AgentName) -> bool;

    /// Validate the attempt and approve or reject it.
    async fn after_properties(&self, state: &mut ConnectionState) -> Result<(), AdmissionError>;

    /// Construct the channel and store it in the state.
    async fn before_channel(&self, state: &mut ConnectionState) -> Result<(), AdmissionError>;

    async fn after_channel(&self, state: &mut ConnectionState) -> Result<(), AdmissionError>;

    async fn channel_closed(&self, state: &mut ConnectionState, cause: &CloseCause);
}

/// Cross-cutting extension point run for every owned connection.
#[async_trait]
pub trait ConnectionHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_properties(&self, _state: &mut ConnectionState) -> Result<(), AdmissionError> {
        Ok(())
    }

    async fn before_channel(&self, _state: &mut ConnectionState) -> Result<(), AdmissionError> {
        Ok(())
    }

    async fn after_channel(&self, _state: &mut ConnectionState) {}

    async fn channel_closed(&self, _state: &mut ConnectionState, _cause: &CloseCause) {}
}

/// Stash entry: the agent record this connection was admitted for.
struct AdmittedAgent(Arc<AgentNode>);

/// Built-in receiver for inbound network agents.
pub struct NetworkAgentReceiver {
    validator: Arc<AgentIdentityValidator>,
    reconnection: Arc<ReconnectionController>,
    establisher: Arc<ChannelEstablisher>,
    event_bus: EventBus,
}

impl NetworkAgentReceiver {
    pub fn new(
        validator: Arc<AgentIdentityValidator>,
        reconnection: Arc<ReconnectionController>,
        establisher: Arc<ChannelEstablisher>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            validator,
            reconnection,
            establisher,
            event_bus,
        }
    }

    fn admitted_agent(state: &ConnectionState) -> Result<Arc<AgentNode>, AdmissionError> {
        state
            .stash()
            .get::<AdmittedAgent>()
            .map(|admitted| admitted.0.clone())
            .ok_or_else(|| AdmissionError::NotApproved(state.identity().to_string()))
    }
}

#[async_trait]
impl AgentReceiver for NetworkAgentReceiver {
    fn name(&self) -> &str {
        "network-agent"
    }

    async fn owns(&self, identity: &AgentName) -> bool {
        self.validator.owns(identity).await
    }

    async fn after_properties(&self, state: &mut ConnectionState) -> Result<(), AdmissionError> {
        let identity = state.identity().clone();
        let agent = self.validator.resolve(&identity).await?;
        let validation = self.validator.validate_launcher_chain(&agent)?;
        debug!(agent = %identity, terminal = %validation.terminal, "Launcher chain validated");

        let presented = state.presented_cookie();
        let admission = self.reconnection.admit(&agent, presented.as_ref()).await?;

        state.set_issued_cookie(admission.cookie);
        state.stash_mut().insert(admission.lease);
        state.stash_mut().insert(AdmittedAgent(agent));
        state.approve();
        Ok(())
    }

    async fn before_channel(&self, state: &mut ConnectionState) -> Result<(), AdmissionError> {
        let agent = Self::admitted_agent(state)?;
        self.establisher.finalize(state, &agent).await?;
        Ok(())
    }

    async fn after_channel(&self, state: &mut ConnectionState) -> Result<(), AdmissionError> {
        drop(state.stash_mut().take::<IdentityLease>());

        if let Some(channel) = state.channel() {
            info!(agent = %channel.agent(), channel = %channel.id(), remote = %state.remote(), "Agent connected");
            self.event_bus.publish_connection_event(ConnectionEvent::AgentConnected {
                agent: channel.agent().clone(),
                channel: channel.id(),
                remote: Some(state.remote().to_string()),
                connected_at: channel.connected_at(),
            });
        }
        Ok(())
    }

    async fn channel_closed(&self, state: &mut ConnectionState, cause: &CloseCause) {
        drop(state.stash_mut().take::<IdentityLease>());

        let Some(AdmittedAgent(agent)) = state.stash_mut().take::<AdmittedAgent>() else {
            return;
        };
        let Some(channel) = state.channel().cloned() else {
            return;
        };

        if agent.clear_channel_if(channel.id()) {
            debug!(agent = %agent.name(), channel = %channel.id(), "Cleared live channel reference");
        }
        info!(agent = %agent.name(), channel = %channel.id(), %cause, "Agent disconnected");
        self.event_bus.publish_connection_event(ConnectionEvent::AgentDisconnected {
            agent: agent.name().clone(),
            channel: channel.id(),
            cause: cause.to_string(),
            disconnected_at: Utc::now(),
        });
    }
}
