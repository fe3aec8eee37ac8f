// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model for agent provisioning and connection admission.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Entities, value objects and the extension contracts
//!   (launchers, clouds, listeners, registry, permission gate) that the
//!   application services depend on.

pub mod agent;
pub mod channel;
pub mod cloud;
pub mod connection;
pub mod controller_config;
pub mod events;
pub mod launcher;
pub mod log_sink;
pub mod protocol;
pub mod provisioning;
pub mod registry;
pub mod security;
