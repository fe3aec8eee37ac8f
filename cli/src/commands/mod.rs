// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for Hangar CLI

pub mod config;

pub use self::config::ConfigCommand;
