// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::io;

use crate::domain::agent::AgentName;

/// Durable per-agent transcript of a channel's life.
///
/// Implementations must flush on `close` and also when dropped, so a sink is
/// released on every exit path including task cancellation.
pub trait LogSink: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Flush and release the sink. Further writes may fail.
    fn close(&mut self) -> io::Result<()>;
}

pub trait LogSinkProvider: Send + Sync {
    fn open(&self, agent: &AgentName) -> io::Result<Box<dyn LogSink>>;
}
