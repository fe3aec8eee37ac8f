// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Connection State
//!
//! One [`ConnectionState`] exists per connection attempt. It carries the
//! peer's protocol properties, the approve/reject [`Decision`], a type-keyed
//! [`Stash`] for receiver-local data, and the channel builder / driver while
//! the channel is being constructed.
//!
//! ## Invariants
//!
//! - The decision is set at most once. Later `approve`/`reject` calls are ignored.
//! - The phase only moves forward (see [`ConnectionPhase`]).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::agent::{AgentName, Cookie};
use crate::domain::channel::{Channel, ChannelBuilder, ChannelDriver};
use crate::domain::protocol::{AGENT_NAME_PROPERTY, COOKIE_PROPERTY};

/// Reasons a connection attempt is refused or torn down before going live.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("unknown agent '{0}'")]
    UnknownIdentity(String),

    #[error("launcher chain of agent '{agent}' is not a network agent launcher: {detail}")]
    LauncherChainMismatch { agent: String, detail: String },

    #[error("agent '{0}' is already connected")]
    IdentityAlreadyConnected(String),

    #[error("failed to construct channel for agent '{agent}': {reason}")]
    ChannelConstructionFailed { agent: String, reason: String },

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("no receiver approved the connection for '{0}'")]
    NotApproved(String),
}

impl AdmissionError {
    /// Short machine-readable cause sent back to the peer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownIdentity(_) => "unknown-agent",
            Self::LauncherChainMismatch { .. } => "launcher-mismatch",
            Self::IdentityAlreadyConnected(_) => "already-connected",
            Self::ChannelConstructionFailed { .. } => "channel-failed",
            Self::Rejected(_) => "rejected",
            Self::Protocol(_) => "protocol-error",
            Self::Cancelled => "cancelled",
            Self::NotApproved(_) => "not-approved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Approved,
    Rejected(AdmissionError),
}

/// Why an owned connection ended. Passed to `channel_closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer closed the channel.
    PeerClosed,
    /// The controller closed the channel (preemption, disconnect, shutdown).
    Closed(String),
    /// The channel failed with an I/O or framing error.
    Io(String),
    /// The attempt was rejected before a channel existed.
    Rejected(AdmissionError),
    /// The attempt was approved but the channel could not be brought up.
    Failed(AdmissionError),
    /// The owning task was cancelled.
    Cancelled,
}

impl CloseCause {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::Closed(_))
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Closed(reason) => write!(f, "closed: {}", reason),
            Self::Io(reason) => write!(f, "I/O failure: {}", reason),
            Self::Rejected(e) => write!(f, "rejected: {}", e),
            Self::Failed(e) => write!(f, "failed: {}", e),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Named states of the admission state machine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Properties received, no receiver chosen yet.
    Handshake,
    /// A receiver owns the claimed identity.
    Owned,
    /// `after_properties` completed and the attempt is approved.
    PropertiesAccepted,
    /// `before_channel` constructed the channel.
    ChannelBuilt,
    /// `after_channel` completed; frames are flowing.
    Live,
    Closed,
}

/// Type-keyed storage for receiver-local data.
#[derive(Default)]
pub struct Stash {
    entries: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Stash {
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.entries
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn take<T: Any + Send>(&mut self) -> Option<T> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains<T: Any + Send>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ConnectionState {
    id: ConnectionId,
    identity: AgentName,
    properties: HashMap<String, String>,
    remote: SocketAddr,
    phase: ConnectionPhase,
    decision: Decision,
    stash: Stash,
    issued_cookie: Option<Cookie>,
    channel_builder: Option<ChannelBuilder>,
    channel_driver: Option<ChannelDriver>,
    channel: Option<Arc<Channel>>,
}

impl ConnectionState {
    /// Build the state for a new attempt. Fails if the identity claim is missing.
    pub fn new(properties: HashMap<String, String>, remote: SocketAddr) -> Result<Self, AdmissionError> {
        let identity = properties
            .get(AGENT_NAME_PROPERTY)
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(AgentName::new)
            .ok_or_else(|| AdmissionError::Protocol(format!("missing '{}' property", AGENT_NAME_PROPERTY)))?;

        Ok(Self {
            id: ConnectionId::new(),
            identity,
            properties,
            remote,
            phase: ConnectionPhase::Handshake,
            decision: Decision::Pending,
            stash: Stash::default(),
            issued_cookie: None,
            channel_builder: None,
            channel_driver: None,
            channel: None,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The identity the peer claims.
    pub fn identity(&self) -> &AgentName {
        &self.identity
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The cookie the peer presented, if any.
    pub fn presented_cookie(&self) -> Option<Cookie> {
        self.property(COOKIE_PROPERTY)
            .filter(|value| !value.is_empty())
            .map(Cookie::new)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Move forward to `next`. Backwards transitions are ignored.
    pub fn advance(&mut self, next: ConnectionPhase) {
        if next > self.phase {
            debug!(connection = %self.id, from = ?self.phase, to = ?next, "Connection phase transition");
            self.phase = next;
        }
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approved
    }

    pub fn rejection(&self) -> Option<&AdmissionError> {
        match &self.decision {
            Decision::Rejected(cause) => Some(cause),
            _ => None,
        }
    }

    /// Approve the attempt. Returns `false` if a decision was already made.
    pub fn approve(&mut self) -> bool {
        self.decide(Decision::Approved)
    }

    /// Reject the attempt. Returns `false` if a decision was already made.
    pub fn reject(&mut self, cause: AdmissionError) -> bool {
        self.decide(Decision::Rejected(cause))
    }

    fn decide(&mut self, decision: Decision) -> bool {
        if self.decision != Decision::Pending {
            debug!(connection = %self.id, current = ?self.decision, ignored = ?decision, "Decision already made");
            return false;
        }
        self.decision = decision;
        true
    }

    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    pub fn stash_mut(&mut self) -> &mut Stash {
        &mut self.stash
    }

    pub fn issued_cookie(&self) -> Option<&Cookie> {
        self.issued_cookie.as_ref()
    }

    pub fn set_issued_cookie(&mut self, cookie: Cookie) {
        self.issued_cookie = Some(cookie);
    }

    pub fn set_channel_builder(&mut self, builder: ChannelBuilder) {
        self.channel_builder = Some(builder);
    }

    pub fn channel_builder_mut(&mut self) -> Option<&mut ChannelBuilder> {
        self.channel_builder.as_mut()
    }

    pub fn take_channel_builder(&mut self) -> Option<ChannelBuilder> {
        self.channel_builder.take()
    }

    pub fn set_channel(&mut self, channel: Arc<Channel>, driver: ChannelDriver) {
        self.channel = Some(channel);
        self.channel_driver = Some(driver);
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.channel.as_ref()
    }

    pub fn take_channel_driver(&mut self) -> Option<ChannelDriver> {
        self.channel_driver.take()
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote", &self.remote)
            .field("phase", &self.phase)
            .field("decision", &self.decision)
            .field("channel", &self.channel.as_ref().map(|c| c.id()))
            .finish()
    }
}
