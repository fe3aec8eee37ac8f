// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Channels
//!
//! A channel is the bidirectional, line-framed link between the controller
//! and an admitted agent. Construction is split in three pieces:
//!
//! - [`ChannelBuilder`] collects negotiated properties and settings. Channel
//!   configurators get mutable access to it before construction.
//! - [`Channel`] is the shared handle published on the agent record: send
//!   frames, subscribe to inbound frames, request close, await termination.
//! - [`ChannelDriver`] owns the transport and log sink and pumps frames until
//!   the peer disconnects, an I/O error occurs, or `Channel::close` is called.
//!
//! A channel whose driver has finished, or was dropped without ever running,
//! reports itself closed and resolves [`Channel::terminated`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_util::codec::{Framed, FramedParts, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::agent::AgentName;
use crate::domain::connection::{AdmissionError, CloseCause};
use crate::domain::log_sink::LogSink;
use crate::domain::protocol::{HandshakeResponse, PING_FRAME, PONG_FRAME};

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

/// Any byte stream a channel can run over (TCP socket, in-memory duplex, ...).
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

pub type FramedTransport = Framed<BoxedTransport, LinesCodec>;

pub fn frame_transport(transport: BoxedTransport, max_frame_length: usize) -> FramedTransport {
    Framed::new(transport, LinesCodec::new_with_max_length(max_frame_length))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("configurator '{configurator}' refused the channel: {reason}")]
    Configurator { configurator: String, reason: String },

    #[error("invalid channel settings: {0}")]
    Invalid(String),

    #[error("failed to write handshake response: {0}")]
    Handshake(String),

    #[error("channel is closed")]
    Closed,
}

/// Inspects or modifies a channel builder before the channel is constructed.
pub trait ChannelConfigurator: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, builder: &mut ChannelBuilder) -> Result<(), ChannelError>;
}

pub struct ChannelBuilder {
    agent: AgentName,
    remote: Option<SocketAddr>,
    transport: FramedTransport,
    properties: BTreeMap<String, String>,
    heartbeat: Option<Duration>,
    max_frame_length: usize,
}

impl ChannelBuilder {
    pub fn new(agent: AgentName, transport: FramedTransport) -> Self {
        let max_frame_length = transport.codec().max_length();
        Self {
            agent,
            remote: None,
            transport,
            properties: BTreeMap::new(),
            heartbeat: None,
            max_frame_length,
        }
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn agent(&self) -> &AgentName {
        &self.agent
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Add a negotiated property; sent to the peer in the approval frame.
    pub fn property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn heartbeat(&mut self, interval: Duration) -> &mut Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat
    }

    pub fn max_frame_length(&mut self, max_frame_length: usize) -> &mut Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn frame_length_limit(&self) -> usize {
        self.max_frame_length
    }

    /// Tell the peer why it was refused, then close the transport.
    pub async fn reject(self, error: &AdmissionError) {
        reject_transport(self.transport, error).await;
    }

    /// Write the approval frame and construct the channel.
    pub async fn build(self) -> Result<(Arc<Channel>, ChannelDriver), ChannelError> {
        if self.heartbeat == Some(Duration::ZERO) {
            return Err(ChannelError::Invalid("heartbeat interval must be positive".to_string()));
        }
        if self.max_frame_length == 0 {
            return Err(ChannelError::Invalid("max frame length must be positive".to_string()));
        }

        let mut transport = if self.transport.codec().max_length() == self.max_frame_length {
            self.transport
        } else {
            reframe(self.transport, self.max_frame_length)
        };

        let response = HandshakeResponse::Approved {
            properties: self.properties.clone(),
        };
        let frame = response
            .to_frame()
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;
        transport
            .send(frame)
            .await
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let channel = Arc::new(Channel {
            id: ChannelId::new(),
            agent: self.agent,
            remote: self.remote,
            properties: self.properties,
            connected_at: Utc::now(),
            outbound: outbound_tx,
            inbound: inbound_tx,
            shutdown: CancellationToken::new(),
            close_cause: Mutex::new(None),
            terminated: terminated_rx,
        });

        let driver = ChannelDriver {
            channel: channel.clone(),
            transport,
            outbound: outbound_rx,
            heartbeat: self.heartbeat,
            log_sink: None,
            terminated: terminated_tx,
        };

        Ok((channel, driver))
    }
}

/// Write a rejection frame on a transport that never became a channel, then close it.
pub async fn reject_transport(mut transport: FramedTransport, error: &AdmissionError) {
    match HandshakeResponse::rejected(error).to_frame() {
        Ok(frame) => {
            if let Err(e) = transport.send(frame).await {
                debug!("Could not deliver rejection frame: {}", e);
            }
        }
        Err(e) => warn!("Failed to encode rejection frame: {}", e),
    }
    let _ = transport.get_mut().shutdown().await;
}

// LinesCodec has no setter for its limit; rebuild the framing while keeping
// any bytes already buffered from the handshake.
fn reframe(transport: FramedTransport, max_frame_length: usize) -> FramedTransport {
    let parts = transport.into_parts();
    let mut reframed = FramedParts::new::<String>(parts.io, LinesCodec::new_with_max_length(max_frame_length));
    reframed.read_buf = parts.read_buf;
    reframed.write_buf = parts.write_buf;
    Framed::from_parts(reframed)
}

/// Shared handle to a constructed channel.
pub struct Channel {
    id: ChannelId,
    agent: AgentName,
    remote: Option<SocketAddr>,
    properties: BTreeMap<String, String>,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<String>,
    inbound: broadcast::Sender<String>,
    shutdown: CancellationToken,
    close_cause: Mutex<Option<String>>,
    terminated: watch::Receiver<bool>,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn agent(&self) -> &AgentName {
        &self.agent
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a frame for the peer.
    pub async fn send(&self, frame: impl Into<String>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(frame.into())
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Inbound frames from the peer (heartbeats excluded).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }

    /// Request the driver to stop. The first cause wins; repeated calls are no-ops.
    pub fn close(&self, cause: impl Into<String>) {
        {
            let mut current = self.close_cause.lock();
            if current.is_none() {
                *current = Some(cause.into());
            }
        }
        self.shutdown.cancel();
    }

    pub fn close_cause(&self) -> Option<String> {
        self.close_cause.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || *self.terminated.borrow() || self.terminated.has_changed().is_err()
    }

    /// Resolves once the driver has released the transport.
    pub async fn terminated(&self) {
        let mut terminated = self.terminated.clone();
        let _ = terminated.wait_for(|done| *done).await;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns the transport of a constructed channel and pumps its frames.
pub struct ChannelDriver {
    channel: Arc<Channel>,
    transport: FramedTransport,
    outbound: mpsc::Receiver<String>,
    heartbeat: Option<Duration>,
    log_sink: Option<Box<dyn LogSink>>,
    terminated: watch::Sender<bool>,
}

impl ChannelDriver {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn attach_log_sink(&mut self, sink: Box<dyn LogSink>) {
        self.log_sink = Some(sink);
    }

    /// Run until the channel terminates. Always releases the transport and log sink.
    pub async fn run(mut self) -> CloseCause {
        let shutdown = self.channel.shutdown.clone();
        let mut heartbeat = self
            .heartbeat
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        let cause = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break CloseCause::Closed(
                        self.channel.close_cause().unwrap_or_else(|| "closed".to_string()),
                    );
                }
                frame = self.transport.next() => match frame {
                    Some(Ok(line)) => {
                        log_frame(&mut self.log_sink, "<<<", &line);
                        if line == PING_FRAME {
                            if let Err(e) = self.transport.send(PONG_FRAME).await {
                                break CloseCause::Io(e.to_string());
                            }
                        } else if line != PONG_FRAME {
                            let _ = self.channel.inbound.send(line);
                        }
                    }
                    Some(Err(e)) => break CloseCause::Io(e.to_string()),
                    None => break CloseCause::PeerClosed,
                },
                Some(frame) = self.outbound.recv() => {
                    log_frame(&mut self.log_sink, ">>>", &frame);
                    if let Err(e) = self.transport.send(frame).await {
                        break CloseCause::Io(e.to_string());
                    }
                }
                _ = next_heartbeat(&mut heartbeat) => {
                    if let Err(e) = self.transport.send(PING_FRAME).await {
                        break CloseCause::Io(e.to_string());
                    }
                }
            }
        };

        self.channel.close(cause.to_string());
        if let Err(e) = self.transport.get_mut().shutdown().await {
            debug!(agent = %self.channel.agent, "Transport shutdown failed: {}", e);
        }

        if let Some(mut sink) = self.log_sink.take() {
            let line = format!("{} channel {} terminated: {}", Utc::now().to_rfc3339(), self.channel.id, cause);
            if let Err(e) = sink.write_line(&line) {
                warn!(agent = %self.channel.agent, "Failed to write agent log: {}", e);
            }
            if let Err(e) = sink.close() {
                warn!(agent = %self.channel.agent, "Failed to close agent log: {}", e);
            }
        }

        self.terminated.send_replace(true);
        cause
    }
}

fn log_frame(sink: &mut Option<Box<dyn LogSink>>, direction: &str, frame: &str) {
    if let Some(sink) = sink.as_mut() {
        if let Err(e) = sink.write_line(&format!("{} {}", direction, frame)) {
            debug!("Agent log write failed: {}", e);
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
