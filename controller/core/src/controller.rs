// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Controller
//!
//! Composition root. Builds the provisioning and admission object graph from
//! a validated [`ControllerConfigManifest`]:
//!
//! ```text
//! EventBus ─┬─▶ ProvisioningCoordinator ◀── ProvisioningListenerRegistry
//!           ├─▶ ReconnectionController
//!           └─▶ ProtocolDispatcher ──▶ NetworkAgentReceiver
//!                                        ├─ AgentIdentityValidator
//!                                        ├─ ReconnectionController
//!                                        └─ ChannelEstablisher ◀── FileLogSinkProvider
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::application::admin::AgentAdminService;
use crate::application::channel_establisher::{ChannelEstablisher, HeartbeatConfigurator};
use crate::application::identity::AgentIdentityValidator;
use crate::application::listener_registry::ProvisioningListenerRegistry;
use crate::application::provisioning::ProvisioningCoordinator;
use crate::application::reconnection::ReconnectionController;
use crate::domain::controller_config::ControllerConfigManifest;
use crate::domain::registry::{AgentRegistry, RegistryError};
use crate::domain::security::PermissionGate;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::log_sink::FileLogSinkProvider;
use crate::infrastructure::registry::InMemoryAgentRegistry;
use crate::presentation::dispatcher::ProtocolDispatcher;
use crate::presentation::receiver::NetworkAgentReceiver;

pub struct Controller {
    config: ControllerConfigManifest,
    event_bus: EventBus,
    registry: Arc<InMemoryAgentRegistry>,
    listeners: Arc<ProvisioningListenerRegistry>,
    coordinator: Arc<ProvisioningCoordinator>,
    reconnection: Arc<ReconnectionController>,
    establisher: Arc<ChannelEstablisher>,
    dispatcher: Arc<ProtocolDispatcher>,
}

impl Controller {
    pub fn from_config(config: ControllerConfigManifest) -> anyhow::Result<Self> {
        config.validate().context("Configuration validation failed")?;
        let spec = &config.spec;

        let event_bus = EventBus::with_default_capacity();
        let registry = Arc::new(match spec.registry.capacity {
            Some(capacity) => InMemoryAgentRegistry::with_capacity(capacity),
            None => InMemoryAgentRegistry::new(),
        });

        let listeners = Arc::new(ProvisioningListenerRegistry::new());
        let coordinator = Arc::new(ProvisioningCoordinator::new(
            listeners.clone(),
            registry.clone(),
            event_bus.clone(),
        ));

        let validator = Arc::new(
            AgentIdentityValidator::new(registry.clone())
                .with_policy(spec.admission.launcher_policy)
                .with_max_depth(spec.admission.max_launcher_depth),
        );
        let reconnection = Arc::new(
            ReconnectionController::new(event_bus.clone()).with_preempt_timeout(config.preempt_timeout()),
        );

        let establisher = Arc::new(ChannelEstablisher::new(Arc::new(FileLogSinkProvider::new(
            spec.channel.log_dir.clone(),
        ))));
        if let Some(interval) = config.heartbeat_interval() {
            establisher.add_configurator(Arc::new(HeartbeatConfigurator::new(interval)));
        }

        let dispatcher = Arc::new(
            ProtocolDispatcher::new(event_bus.clone())
                .with_handshake_timeout(config.handshake_timeout())
                .with_max_frame_length(spec.channel.max_frame_length),
        );
        dispatcher.add_receiver(Arc::new(NetworkAgentReceiver::new(
            validator,
            reconnection.clone(),
            establisher.clone(),
            event_bus.clone(),
        )));

        Ok(Self {
            config,
            event_bus,
            registry,
            listeners,
            coordinator,
            reconnection,
            establisher,
            dispatcher,
        })
    }

    /// Register the statically declared agents. Returns how many were added.
    pub async fn register_declared_agents(&self) -> Result<usize, RegistryError> {
        for declaration in &self.config.spec.agents {
            self.registry.register_agent(Arc::new(declaration.to_agent())).await?;
            info!(agent = %declaration.name, "Registered declared agent");
        }
        Ok(self.config.spec.agents.len())
    }

    pub fn config(&self) -> &ControllerConfigManifest {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn registry(&self) -> Arc<dyn AgentRegistry> {
        self.registry.clone()
    }

    pub fn listeners(&self) -> &Arc<ProvisioningListenerRegistry> {
        &self.listeners
    }

    pub fn coordinator(&self) -> &Arc<ProvisioningCoordinator> {
        &self.coordinator
    }

    pub fn establisher(&self) -> &Arc<ChannelEstablisher> {
        &self.establisher
    }

    pub fn dispatcher(&self) -> &Arc<ProtocolDispatcher> {
        &self.dispatcher
    }

    pub fn admin(&self, gate: Arc<dyn PermissionGate>) -> AgentAdminService {
        AgentAdminService::new(self.registry.clone(), self.reconnection.clone(), gate)
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let address = self.config.listen_address();
        TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind agent listener to {}", address))
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        self.dispatcher.serve(listener).await.context("Agent listener failed")
    }

    pub async fn shutdown(&self) {
        info!("Shutting down controller");
        self.dispatcher.shutdown().await;
    }
}
