// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod admin;
pub mod channel_establisher;
pub mod identity;
pub mod listener_registry;
pub mod provisioning;
pub mod reconnection;

// Re-export services for convenience
pub use admin::{AdminError, AgentAdminService};
pub use channel_establisher::{ChannelEstablisher, HeartbeatConfigurator};
pub use identity::{AgentIdentityValidator, LauncherValidation};
pub use listener_registry::ProvisioningListenerRegistry;
pub use provisioning::{ProvisioningCoordinator, ProvisioningTicket};
pub use reconnection::{Admission, IdentityLease, ReconnectionController};
