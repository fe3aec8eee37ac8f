// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Aggregate
//!
//! An [`AgentNode`] is a worker known to the cluster registry. Besides its
//! static description (name, launcher, executors, labels) it carries the
//! connection slot mutated during admission:
//!
//! - the live [`Channel`] (at most one per agent at any instant)
//! - the last reconnection [`Cookie`] issued to a peer claiming this identity
//!
//! The slot is only written by the reconnection controller, the channel
//! establisher and the receiver's close path, all of which run under the
//! per-identity admission lease.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::channel::{Channel, ChannelId};
use crate::domain::launcher::{describe_chain, Launcher};

/// Unique agent identity (the node name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AgentName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque reconnection token handed to a peer on every successful admission.
///
/// Presenting the current cookie on a later connection proves the peer is the
/// same one that holds the live channel.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cookie(String);

impl Cookie {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Cookies are credentials; keep them out of logs.
impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cookie(****)")
    }
}

#[derive(Default)]
struct ConnectionSlot {
    channel: Option<Arc<Channel>>,
    cookie: Option<Cookie>,
}

/// A worker node registered (or about to be registered) in the cluster.
pub struct AgentNode {
    name: AgentName,
    launcher: Arc<dyn Launcher>,
    num_executors: u32,
    labels: Vec<String>,
    slot: Mutex<ConnectionSlot>,
}

impl AgentNode {
    pub fn new(name: impl Into<AgentName>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            name: name.into(),
            launcher,
            num_executors: 1,
            labels: Vec::new(),
            slot: Mutex::new(ConnectionSlot::default()),
        }
    }

    pub fn with_executors(mut self, num_executors: u32) -> Self {
        self.num_executors = num_executors;
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &AgentName {
        &self.name
    }

    pub fn launcher(&self) -> &Arc<dyn Launcher> {
        &self.launcher
    }

    /// Launcher descriptors, outermost first, bounded by `max_depth`.
    pub fn launcher_chain(&self, max_depth: usize) -> Vec<String> {
        describe_chain(self.launcher.as_ref(), max_depth)
    }

    pub fn num_executors(&self) -> u32 {
        self.num_executors
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The channel currently published for this agent, if it is still open.
    pub fn live_channel(&self) -> Option<Arc<Channel>> {
        self.slot
            .lock()
            .channel
            .as_ref()
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    pub fn is_online(&self) -> bool {
        self.live_channel().is_some()
    }

    pub fn last_cookie(&self) -> Option<Cookie> {
        self.slot.lock().cookie.clone()
    }

    pub(crate) fn record_cookie(&self, cookie: Cookie) {
        self.slot.lock().cookie = Some(cookie);
    }

    /// Publish `channel` as the live channel, returning whatever it replaced.
    pub(crate) fn publish_channel(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.slot.lock().channel.replace(channel)
    }

    /// Clear the channel reference only if it still points at `channel_id`.
    pub(crate) fn clear_channel_if(&self, channel_id: ChannelId) -> bool {
        let mut slot = self.slot.lock();
        match &slot.channel {
            Some(current) if current.id() == channel_id => {
                slot.channel = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_channel(&self) -> Option<Arc<Channel>> {
        self.slot.lock().channel.take()
    }
}

impl fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentNode")
            .field("name", &self.name)
            .field("launcher", &self.launcher.display_name())
            .field("num_executors", &self.num_executors)
            .field("online", &self.is_online())
            .finish()
    }
}

/// Read-only view of an agent for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: AgentName,
    pub online: bool,
    pub launcher: String,
    pub num_executors: u32,
}

impl From<&AgentNode> for AgentSummary {
    fn from(agent: &AgentNode) -> Self {
        Self {
            name: agent.name().clone(),
            online: agent.is_online(),
            launcher: agent.launcher().display_name(),
            num_executors: agent.num_executors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::launcher::LauncherSpec;

    fn network_agent(name: &str) -> AgentNode {
        AgentNode::new(name, Arc::new(LauncherSpec::network()))
    }

    #[test]
    fn test_new_agent_is_offline_without_cookie() {
        let agent = network_agent("build-1");
        assert_eq!(agent.name().as_str(), "build-1");
        assert!(!agent.is_online());
        assert!(agent.last_cookie().is_none());
        assert_eq!(agent.num_executors(), 1);
    }

    #[test]
    fn test_cookie_debug_is_redacted() {
        let cookie = Cookie::new("secret-value");
        assert_eq!(format!("{:?}", cookie), "Cookie(****)");
        assert_eq!(cookie.as_str(), "secret-value");
    }

    #[test]
    fn test_record_cookie_overwrites_previous() {
        let agent = network_agent("build-1");
        agent.record_cookie(Cookie::new("a"));
        agent.record_cookie(Cookie::new("b"));
        assert_eq!(agent.last_cookie(), Some(Cookie::new("b")));
    }

    #[test]
    fn test_summary_reflects_launcher() {
        let agent = network_agent("build-2").with_executors(4);
        let summary = AgentSummary::from(&agent);
        assert_eq!(summary.name, AgentName::from("build-2"));
        assert!(!summary.online);
        assert_eq!(summary.launcher, "network");
        assert_eq!(summary.num_executors, 4);
    }
}
