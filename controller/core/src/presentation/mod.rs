// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`hangar-core`)
//!
//! Network surface that agents connect to. No admission policy lives here;
//! the dispatcher drives receivers, and receivers delegate to
//! `crate::application` services.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`dispatcher`] | Accept loop and per-connection admission state machine |
//! | [`receiver`] | Receiver and hook extension points, built-in network agent receiver |

pub mod dispatcher;
pub mod receiver;
