// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::application::reconnection::ReconnectionController;
use crate::domain::agent::{AgentName, AgentSummary};
use crate::domain::registry::{AgentRegistry, RegistryError};
use crate::domain::security::{Permission, PermissionGate, Subject};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("'{subject}' lacks the {permission:?} permission")]
    PermissionDenied { subject: Subject, permission: Permission },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Operator actions on registered agents, guarded by the permission gate.
pub struct AgentAdminService {
    registry: Arc<dyn AgentRegistry>,
    reconnection: Arc<ReconnectionController>,
    gate: Arc<dyn PermissionGate>,
}

impl AgentAdminService {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        reconnection: Arc<ReconnectionController>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            registry,
            reconnection,
            gate,
        }
    }

    fn authorize(&self, subject: &Subject, permission: Permission) -> Result<(), AdminError> {
        if self.gate.has_permission(subject, permission) {
            Ok(())
        } else {
            Err(AdminError::PermissionDenied {
                subject: subject.clone(),
                permission,
            })
        }
    }

    /// Close the agent's live channel. Returns whether one was open.
    pub async fn disconnect(&self, subject: &Subject, agent: &AgentName, reason: &str) -> Result<bool, AdminError> {
        self.authorize(subject, Permission::Disconnect)?;
        let node = self
            .registry
            .lookup_agent(agent)
            .await
            .ok_or_else(|| RegistryError::NotFound(agent.clone()))?;

        let _lease = self.reconnection.lock_identity(agent).await;
        match node.live_channel() {
            Some(channel) => {
                info!(agent = %agent, %subject, reason, "Disconnecting agent");
                channel.close(format!("disconnected by {}: {}", subject, reason));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close any live channel and remove the agent from the cluster.
    pub async fn remove(&self, subject: &Subject, agent: &AgentName) -> Result<(), AdminError> {
        self.authorize(subject, Permission::Delete)?;

        {
            let _lease = self.reconnection.lock_identity(agent).await;
            let node = self.registry.remove_agent(agent).await?;
            if let Some(channel) = node.take_channel() {
                channel.close(format!("agent removed by {}", subject));
            }
            info!(agent = %agent, %subject, "Agent removed");
        }
        self.reconnection.forget(agent);
        Ok(())
    }

    pub async fn list(&self) -> Vec<AgentSummary> {
        let mut summaries: Vec<AgentSummary> = self
            .registry
            .list_agents()
            .await
            .iter()
            .map(|agent| AgentSummary::from(agent.as_ref()))
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentNode;
    use crate::domain::channel::{frame_transport, ChannelBuilder};
    use crate::domain::launcher::LauncherSpec;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::registry::InMemoryAgentRegistry;
    use std::collections::HashSet;

    struct Grants(HashSet<Permission>);

    impl PermissionGate for Grants {
        fn has_permission(&self, _subject: &Subject, permission: Permission) -> bool {
            self.0.contains(&permission)
        }
    }

    async fn service(grants: &[Permission]) -> (AgentAdminService, Arc<InMemoryAgentRegistry>) {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        for name in ["build-2", "build-1"] {
            registry
                .register_agent(Arc::new(AgentNode::new(name, Arc::new(LauncherSpec::network()))))
                .await
                .unwrap();
        }
        let service = AgentAdminService::new(
            registry.clone(),
            Arc::new(ReconnectionController::new(EventBus::new(16))),
            Arc::new(Grants(grants.iter().copied().collect())),
        );
        (service, registry)
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_needs_no_permission() {
        let (service, _) = service(&[]).await;
        let names: Vec<_> = service.list().await.into_iter().map(|s| s.name.to_string()).collect();
        assert_eq!(names, vec!["build-1", "build-2"]);
    }

    #[tokio::test]
    async fn test_remove_requires_delete_permission() {
        let (service, registry) = service(&[Permission::Disconnect]).await;
        let operator = Subject::new("alice");
        let err = service.remove(&operator, &AgentName::from("build-1")).await.unwrap_err();
        assert!(matches!(err, AdminError::PermissionDenied { permission: Permission::Delete, .. }));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_live_channel() {
        let (service, registry) = service(&[Permission::Disconnect, Permission::Delete]).await;
        let name = AgentName::from("build-1");
        let node = registry.lookup_agent(&name).await.unwrap();

        let (controller_side, _peer) = tokio::io::duplex(1024);
        let builder = ChannelBuilder::new(name.clone(), frame_transport(Box::new(controller_side), 1024));
        let (channel, _driver) = builder.build().await.unwrap();
        node.publish_channel(channel.clone());

        let operator = Subject::new("alice");
        assert!(service.disconnect(&operator, &name, "maintenance").await.unwrap());
        assert!(channel.is_closed());
        assert!(channel.close_cause().unwrap().contains("maintenance"));
        assert!(!service.disconnect(&operator, &name, "again").await.unwrap());

        service.remove(&operator, &name).await.unwrap();
        assert!(registry.lookup_agent(&name).await.is_none());
    }
}
