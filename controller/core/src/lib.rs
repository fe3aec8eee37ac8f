// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Hangar controller core
//!
//! Agent provisioning lifecycle and connection admission for the Hangar
//! build controller.
//!
//! # Architecture
//!
//! - **domain:** agents, launchers, clouds, connection state, channels, events
//! - **application:** provisioning coordinator, identity validation, reconnection dedup, channel establishment
//! - **infrastructure:** in-memory registry, event bus, cookies, file log sinks, template cloud
//! - **presentation:** protocol dispatcher and agent receivers

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;
pub mod controller;

pub use controller::Controller;
pub use domain::*;
