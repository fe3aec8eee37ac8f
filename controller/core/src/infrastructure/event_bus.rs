// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Observers (CLI, tests, audit sinks) subscribe to provisioning and
// connection events. Events are not persisted.

use crate::domain::agent::AgentName;
use crate::domain::events::{ConnectionEvent, ProvisioningEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Provisioning(ProvisioningEvent),
    Connection(ConnectionEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_provisioning_event(&self, event: ProvisioningEvent) {
        self.publish(DomainEvent::Provisioning(event));
    }

    pub fn publish_connection_event(&self, event: ConnectionEvent) {
        self.publish(DomainEvent::Connection(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() fails only when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe to connection events of a single agent
    pub fn subscribe_agent(&self, agent: AgentName) -> AgentEventReceiver {
        let receiver = self.sender.subscribe();
        AgentEventReceiver { receiver, agent }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until an event is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for connection events of one agent (filtered)
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    agent: AgentName,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Result<ConnectionEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Connection(connection_event) = event {
                if self.matches_agent(&connection_event) {
                    return Ok(connection_event);
                }
            }
        }
    }

    fn matches_agent(&self, event: &ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::AgentConnected { agent, .. } => agent == &self.agent,
            ConnectionEvent::AgentDisconnected { agent, .. } => agent == &self.agent,
            ConnectionEvent::ChannelPreempted { agent, .. } => agent == &self.agent,
            ConnectionEvent::ConnectionRejected { claimed, .. } => {
                claimed.as_deref() == Some(self.agent.as_str())
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::ChannelId;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_provisioning_event(ProvisioningEvent::CapacityBlocked {
            cloud: "ec2".to_string(),
            label: None,
            cause: "quota: exhausted".to_string(),
            blocked_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Provisioning(ProvisioningEvent::CapacityBlocked { cloud, .. }) => {
                assert_eq!(cloud, "ec2");
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_agent_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_agent(AgentName::from("build-1"));

        event_bus.publish_connection_event(ConnectionEvent::AgentConnected {
            agent: AgentName::from("build-2"),
            channel: ChannelId::new(),
            remote: None,
            connected_at: Utc::now(),
        });
        event_bus.publish_connection_event(ConnectionEvent::ConnectionRejected {
            claimed: Some("build-1".to_string()),
            remote: None,
            cause: "already-connected".to_string(),
            rejected_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            ConnectionEvent::ConnectionRejected { cause, .. } => assert_eq!(cause, "already-connected"),
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_connection_event(ConnectionEvent::ChannelPreempted {
            agent: AgentName::from("build-1"),
            channel: ChannelId::new(),
            preempted_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
    }
}
