// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod cloud;
pub mod cookie;
pub mod event_bus;
pub mod log_sink;
pub mod registry;

pub use cloud::TemplateCloud;
pub use event_bus::{DomainEvent, EventBus, EventBusError};
pub use log_sink::FileLogSinkProvider;
pub use registry::InMemoryAgentRegistry;
