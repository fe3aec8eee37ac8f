// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - Controller start-up from configuration
//! - Graceful shutdown on Ctrl+C and SIGTERM

pub mod server;

pub use server::run_daemon;
