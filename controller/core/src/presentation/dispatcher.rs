// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Protocol Dispatcher
//!
//! Network entry point for agent connections. One task per socket:
//!
//! ```text
//! Handshake ─▶ Owned ─▶ PropertiesAccepted ─▶ ChannelBuilt ─▶ Live ─▶ Closed
//!     │           │              │                  │
//!     └───────────┴──────────────┴──────────────────┴──▶ rejected / failed
//! ```
//!
//! The dispatcher reads the properties frame, offers the claimed identity to
//! each receiver in registration order, and drives the first owner through
//! its phases. Once a receiver owns a connection, `channel_closed` is
//! delivered exactly once, including when the connection task is dropped
//! mid-admission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::domain::agent::AgentName;
use crate::domain::channel::{frame_transport, reject_transport, BoxedTransport, ChannelBuilder, ChannelDriver, FramedTransport};
use crate::domain::connection::{AdmissionError, CloseCause, ConnectionId, ConnectionPhase, ConnectionState};
use crate::domain::events::ConnectionEvent;
use crate::domain::protocol::{parse_properties, DEFAULT_MAX_FRAME_LENGTH};
use crate::infrastructure::event_bus::EventBus;
use crate::presentation::receiver::{AgentReceiver, ConnectionHook};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Refused before a channel went live.
    Rejected(AdmissionError),
    /// The channel went live and later terminated.
    Closed(CloseCause),
}

pub struct ProtocolDispatcher {
    receivers: RwLock<Vec<Arc<dyn AgentReceiver>>>,
    hooks: RwLock<Vec<Arc<dyn ConnectionHook>>>,
    handshake_timeout: Duration,
    max_frame_length: usize,
    event_bus: EventBus,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// A connection owned by a receiver. Dropping it without `close` reports a
/// cancellation to the receiver and hooks from a detached task.
struct OwnedConnection {
    receiver: Arc<dyn AgentReceiver>,
    hooks: Vec<Arc<dyn ConnectionHook>>,
    state: ConnectionState,
}

impl OwnedConnection {
    async fn close(&mut self, cause: &CloseCause) {
        self.state.advance(ConnectionPhase::Closed);
        self.receiver.channel_closed(&mut self.state, cause).await;
        for hook in &self.hooks {
            hook.channel_closed(&mut self.state, cause).await;
        }
    }

    fn close_detached(mut self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(connection = %self.state.id(), "Connection task dropped, reporting cancellation");
                handle.spawn(async move {
                    if let Some(channel) = self.state.channel() {
                        channel.close("connection task cancelled");
                    }
                    self.close(&CloseCause::Cancelled).await;
                });
            }
            Err(_) => warn!(
                connection = %self.state.id(),
                agent = %self.state.identity(),
                "No runtime available to report connection cancellation"
            ),
        }
    }
}

impl ProtocolDispatcher {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            receivers: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            event_bus,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Receivers are offered connections in registration order.
    pub fn add_receiver(&self, receiver: Arc<dyn AgentReceiver>) {
        debug!(receiver = receiver.name(), "Registering agent receiver");
        self.receivers.write().push(receiver);
    }

    pub fn add_hook(&self, hook: Arc<dyn ConnectionHook>) {
        debug!(hook = hook.name(), "Registering connection hook");
        self.hooks.write().push(hook);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is requested.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("Accepting agent connections on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, remote)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!(%remote, "Failed to set TCP_NODELAY: {}", e);
                        }
                        self.spawn_connection(Box::new(socket), remote);
                    }
                    Err(e) => warn!("Failed to accept agent connection: {}", e),
                },
            }
        }
        info!("Agent listener stopped");
        Ok(())
    }

    pub fn spawn_connection(self: &Arc<Self>, transport: BoxedTransport, remote: SocketAddr) -> JoinHandle<ConnectionOutcome> {
        let dispatcher = Arc::clone(self);
        self.tasks.spawn(async move { dispatcher.accept(transport, remote).await })
    }

    /// Stop accepting, cancel pending admissions, close live channels and
    /// wait for every connection task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Drive one connection from handshake to termination.
    pub async fn accept(&self, transport: BoxedTransport, remote: SocketAddr) -> ConnectionOutcome {
        let mut framed = frame_transport(transport, self.max_frame_length);

        let properties = match self.read_properties(&mut framed).await {
            Ok(properties) => properties,
            Err(err) => return self.reject_unowned(framed, None, remote, err).await,
        };
        let mut state = match ConnectionState::new(properties, remote) {
            Ok(state) => state,
            Err(err) => return self.reject_unowned(framed, None, remote, err).await,
        };
        let identity = state.identity().clone();
        debug!(connection = %state.id(), agent = %identity, %remote, "Received connection properties");

        let Some(receiver) = self.find_owner(&identity).await else {
            let err = AdmissionError::UnknownIdentity(identity.to_string());
            return self.reject_unowned(framed, Some(&identity), remote, err).await;
        };
        state.set_channel_builder(ChannelBuilder::new(identity.clone(), framed).with_remote(remote));
        state.advance(ConnectionPhase::Owned);
        debug!(connection = %state.id(), receiver = receiver.name(), "Receiver owns connection");

        let hooks = self.hooks.read().clone();
        let mut owned = scopeguard::guard(OwnedConnection { receiver, hooks, state }, OwnedConnection::close_detached);

        let admitted = tokio::select! {
            result = self.admit(&mut owned) => result,
            _ = self.shutdown.cancelled() => Err(AdmissionError::Cancelled),
        };

        match admitted {
            Ok(driver) => {
                metrics::counter!("hangar_connections_accepted_total").increment(1);
                let cause = self.run_channel(owned.state.id(), driver).await;
                owned.close(&cause).await;
                scopeguard::ScopeGuard::into_inner(owned);
                ConnectionOutcome::Closed(cause)
            }
            Err(err) => {
                let approved = owned.state.is_approved();
                owned.state.reject(err.clone());
                if let Some(channel) = owned.state.channel() {
                    channel.close(format!("admission failed: {}", err));
                }
                if let Some(builder) = owned.state.take_channel_builder() {
                    builder.reject(&err).await;
                }
                self.record_rejection(Some(&identity), remote, &err);

                let cause = match &err {
                    AdmissionError::Cancelled => CloseCause::Cancelled,
                    _ if approved => CloseCause::Failed(err.clone()),
                    _ => CloseCause::Rejected(err.clone()),
                };
                owned.close(&cause).await;
                scopeguard::ScopeGuard::into_inner(owned);
                ConnectionOutcome::Rejected(err)
            }
        }
    }

    async fn admit(&self, owned: &mut OwnedConnection) -> Result<ChannelDriver, AdmissionError> {
        let OwnedConnection { receiver, hooks, state } = owned;

        for hook in hooks.iter() {
            hook.after_properties(state).await?;
            decided_rejection(state)?;
        }
        receiver.after_properties(state).await?;
        decided_rejection(state)?;
        if !state.is_approved() {
            return Err(AdmissionError::NotApproved(state.identity().to_string()));
        }
        state.advance(ConnectionPhase::PropertiesAccepted);

        for hook in hooks.iter() {
            hook.before_channel(state).await?;
            decided_rejection(state)?;
        }
        receiver.before_channel(state).await?;
        if state.channel().is_none() {
            return Err(AdmissionError::ChannelConstructionFailed {
                agent: state.identity().to_string(),
                reason: format!("receiver '{}' did not construct a channel", receiver.name()),
            });
        }
        state.advance(ConnectionPhase::ChannelBuilt);

        receiver.after_channel(state).await?;
        for hook in hooks.iter() {
            hook.after_channel(state).await;
        }

        let driver = state.take_channel_driver().ok_or_else(|| AdmissionError::ChannelConstructionFailed {
            agent: state.identity().to_string(),
            reason: "channel driver is missing".to_string(),
        })?;
        state.advance(ConnectionPhase::Live);
        Ok(driver)
    }

    async fn run_channel(&self, connection: ConnectionId, driver: ChannelDriver) -> CloseCause {
        let channel = driver.channel().clone();
        let run = driver.run();
        tokio::pin!(run);

        tokio::select! {
            cause = &mut run => cause,
            _ = self.shutdown.cancelled() => {
                debug!(%connection, "Closing channel for shutdown");
                channel.close("controller shutting down");
                run.await
            }
        }
    }

    async fn read_properties(&self, framed: &mut FramedTransport) -> Result<HashMap<String, String>, AdmissionError> {
        let frame = tokio::time::timeout(self.handshake_timeout, framed.next())
            .await
            .map_err(|_| {
                AdmissionError::Protocol(format!("no properties frame within {:?}", self.handshake_timeout))
            })?;

        match frame {
            Some(Ok(line)) => parse_properties(&line),
            Some(Err(e)) => Err(AdmissionError::Protocol(format!("unreadable properties frame: {}", e))),
            None => Err(AdmissionError::Protocol("connection closed before handshake".to_string())),
        }
    }

    async fn find_owner(&self, identity: &AgentName) -> Option<Arc<dyn AgentReceiver>> {
        let receivers = self.receivers.read().clone();
        for receiver in receivers {
            if receiver.owns(identity).await {
                return Some(receiver);
            }
        }
        None
    }

    async fn reject_unowned(
        &self,
        framed: FramedTransport,
        claimed: Option<&AgentName>,
        remote: SocketAddr,
        err: AdmissionError,
    ) -> ConnectionOutcome {
        self.record_rejection(claimed, remote, &err);
        reject_transport(framed, &err).await;
        ConnectionOutcome::Rejected(err)
    }

    fn record_rejection(&self, claimed: Option<&AgentName>, remote: SocketAddr, err: &AdmissionError) {
        info!(agent = ?claimed.map(AgentName::as_str), %remote, cause = err.code(), "Connection rejected: {}", err);
        metrics::counter!("hangar_connections_rejected_total", "cause" => err.code()).increment(1);
        self.event_bus.publish_connection_event(ConnectionEvent::ConnectionRejected {
            claimed: claimed.map(|name| name.to_string()),
            remote: Some(remote.to_string()),
            cause: err.code().to_string(),
            rejected_at: Utc::now(),
        });
    }
}

/// A hook or receiver may reject through the state instead of returning an error.
fn decided_rejection(state: &ConnectionState) -> Result<(), AdmissionError> {
    match state.rejection() {
        Some(cause) => Err(cause.clone()),
        None => Ok(()),
    }
}
