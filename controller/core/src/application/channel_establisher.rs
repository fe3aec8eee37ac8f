// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Channel Establisher
//!
//! Turns an admitted connection into a live channel:
//!
//! 1. open the agent's log sink,
//! 2. run the registered [`ChannelConfigurator`]s in registration order,
//! 3. embed the issued cookie in the negotiated properties,
//! 4. build the channel (writes the approval frame),
//! 5. hand the log sink to the driver and publish the channel on the agent.
//!
//! The log sink is held by a scope guard until step 5, so every failure (and
//! cancellation) path closes it. A configurator failure also sends a
//! rejection frame before the transport is dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::domain::agent::AgentNode;
use crate::domain::channel::{Channel, ChannelBuilder, ChannelConfigurator, ChannelError};
use crate::domain::connection::{AdmissionError, ConnectionState};
use crate::domain::log_sink::{LogSink, LogSinkProvider};
use crate::domain::protocol::{COOKIE_PROPERTY, PROTOCOL_NAME, PROTOCOL_PROPERTY};

pub struct ChannelEstablisher {
    log_sinks: Arc<dyn LogSinkProvider>,
    configurators: RwLock<Vec<Arc<dyn ChannelConfigurator>>>,
}

impl ChannelEstablisher {
    pub fn new(log_sinks: Arc<dyn LogSinkProvider>) -> Self {
        Self {
            log_sinks,
            configurators: RwLock::new(Vec::new()),
        }
    }

    pub fn add_configurator(&self, configurator: Arc<dyn ChannelConfigurator>) {
        debug!(configurator = configurator.name(), "Registering channel configurator");
        self.configurators.write().push(configurator);
    }

    pub async fn finalize(
        &self,
        state: &mut ConnectionState,
        agent: &Arc<AgentNode>,
    ) -> Result<Arc<Channel>, AdmissionError> {
        let failed = |reason: String| AdmissionError::ChannelConstructionFailed {
            agent: agent.name().to_string(),
            reason,
        };

        let mut builder = state
            .take_channel_builder()
            .ok_or_else(|| failed("connection has no channel builder".to_string()))?;

        let sink = match self.log_sinks.open(agent.name()) {
            Ok(sink) => sink,
            Err(e) => {
                let err = failed(format!("cannot open agent log: {}", e));
                builder.reject(&err).await;
                return Err(err);
            }
        };
        let mut sink = scopeguard::guard(sink, |mut sink: Box<dyn LogSink>| {
            if let Err(e) = sink.close() {
                warn!("Failed to close agent log: {}", e);
            }
        });

        if let Err(e) = self.configure(&mut builder) {
            let err = failed(e.to_string());
            record(&mut **sink, agent, &format!("channel construction failed: {}", e));
            builder.reject(&err).await;
            return Err(err);
        }

        builder.property(PROTOCOL_PROPERTY, PROTOCOL_NAME);
        match state.issued_cookie() {
            Some(cookie) => {
                builder.property(COOKIE_PROPERTY, cookie.as_str());
            }
            None => debug!(agent = %agent.name(), "No reconnection cookie issued for this connection"),
        }

        let (channel, mut driver) = match builder.build().await {
            Ok(built) => built,
            Err(e) => {
                record(&mut **sink, agent, &format!("channel construction failed: {}", e));
                return Err(failed(e.to_string()));
            }
        };

        let mut sink = scopeguard::ScopeGuard::into_inner(sink);
        record(
            &mut *sink,
            agent,
            &format!(
                "{} channel {} opened from {}",
                channel.connected_at().to_rfc3339(),
                channel.id(),
                state.remote()
            ),
        );
        driver.attach_log_sink(sink);

        if let Some(previous) = agent.publish_channel(channel.clone()) {
            if previous.id() != channel.id() && !previous.is_closed() {
                debug!(agent = %agent.name(), channel = %previous.id(), "Closing replaced channel");
                previous.close("replaced by a newer channel");
            }
        }

        state.set_channel(channel.clone(), driver);
        Ok(channel)
    }

    fn configure(&self, builder: &mut ChannelBuilder) -> Result<(), ChannelError> {
        let configurators = self.configurators.read().clone();
        for configurator in configurators {
            configurator.configure(builder).map_err(|e| match e {
                ChannelError::Configurator { .. } => e,
                other => ChannelError::Configurator {
                    configurator: configurator.name().to_string(),
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(())
    }
}

/// Applies a controller-wide heartbeat interval to every channel.
pub struct HeartbeatConfigurator {
    interval: Duration,
}

impl HeartbeatConfigurator {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl ChannelConfigurator for HeartbeatConfigurator {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn configure(&self, builder: &mut ChannelBuilder) -> Result<(), ChannelError> {
        if self.interval.is_zero() {
            return Err(ChannelError::Invalid("heartbeat interval must be positive".to_string()));
        }
        builder.heartbeat(self.interval);
        Ok(())
    }
}

fn record(sink: &mut dyn LogSink, agent: &AgentNode, line: &str) {
    if let Err(e) = sink.write_line(line) {
        warn!(agent = %agent.name(), "Failed to write agent log: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{AgentName, Cookie};
    use crate::domain::channel::frame_transport;
    use crate::domain::launcher::LauncherSpec;
    use crate::domain::protocol::{HandshakeResponse, AGENT_NAME_PROPERTY};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    #[derive(Default)]
    struct MemorySinks {
        lines: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<usize>>,
        fail_open: bool,
        fail_writes: bool,
    }

    struct MemorySink {
        lines: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<usize>>,
        fail_writes: bool,
    }

    impl LogSink for MemorySink {
        fn write_line(&mut self, line: &str) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.lines.lock().push(line.to_string());
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            *self.closed.lock() += 1;
            Ok(())
        }
    }

    impl LogSinkProvider for MemorySinks {
        fn open(&self, _agent: &AgentName) -> io::Result<Box<dyn LogSink>> {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume"));
            }
            Ok(Box::new(MemorySink {
                lines: self.lines.clone(),
                closed: self.closed.clone(),
                fail_writes: self.fail_writes,
            }))
        }
    }

    struct Refusing;

    impl ChannelConfigurator for Refusing {
        fn name(&self) -> &str {
            "compression"
        }

        fn configure(&self, _builder: &mut ChannelBuilder) -> Result<(), ChannelError> {
            Err(ChannelError::Invalid("unsupported codec".to_string()))
        }
    }

    fn connection(agent: &AgentNode) -> (ConnectionState, DuplexStream) {
        let (controller_side, peer_side) = tokio::io::duplex(4096);
        let properties = HashMap::from([(AGENT_NAME_PROPERTY.to_string(), agent.name().to_string())]);
        let mut state = ConnectionState::new(properties, "10.0.0.7:41000".parse().unwrap()).unwrap();
        state.set_channel_builder(ChannelBuilder::new(
            agent.name().clone(),
            frame_transport(Box::new(controller_side), 4096),
        ));
        state.set_issued_cookie(Cookie::new("k1"));
        (state, peer_side)
    }

    async fn first_frame(peer: DuplexStream) -> HandshakeResponse {
        let mut lines = BufReader::new(peer).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn agent() -> Arc<AgentNode> {
        Arc::new(AgentNode::new("ec2-1", Arc::new(LauncherSpec::network())))
    }

    #[tokio::test]
    async fn test_finalize_publishes_channel_with_cookie() {
        let sinks = Arc::new(MemorySinks::default());
        let establisher = ChannelEstablisher::new(sinks.clone());
        establisher.add_configurator(Arc::new(HeartbeatConfigurator::new(Duration::from_secs(30))));
        let agent = agent();
        let (mut state, peer) = connection(&agent);

        let channel = establisher.finalize(&mut state, &agent).await.unwrap();
        assert_eq!(channel.property(COOKIE_PROPERTY), Some("k1"));
        assert_eq!(agent.live_channel().map(|c| c.id()), Some(channel.id()));
        assert!(state.take_channel_driver().is_some());
        assert_eq!(*sinks.closed.lock(), 0);

        match first_frame(peer).await {
            HandshakeResponse::Approved { properties } => {
                assert_eq!(properties.get(COOKIE_PROPERTY).map(String::as_str), Some("k1"));
                assert_eq!(properties.get(PROTOCOL_PROPERTY).map(String::as_str), Some(PROTOCOL_NAME));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_configurator_failure_closes_sink_and_rejects() {
        let sinks = Arc::new(MemorySinks::default());
        let establisher = ChannelEstablisher::new(sinks.clone());
        establisher.add_configurator(Arc::new(Refusing));
        let agent = agent();
        let (mut state, peer) = connection(&agent);

        let err = establisher.finalize(&mut state, &agent).await.unwrap_err();
        assert_eq!(err.code(), "channel-failed");
        assert!(err.to_string().contains("compression"));
        assert_eq!(*sinks.closed.lock(), 1);
        assert!(agent.live_channel().is_none());

        match first_frame(peer).await {
            HandshakeResponse::Rejected { cause, .. } => assert_eq!(cause, "channel-failed"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_open_failure_is_surfaced() {
        let sinks = Arc::new(MemorySinks {
            fail_open: true,
            ..Default::default()
        });
        let establisher = ChannelEstablisher::new(sinks);
        let agent = agent();
        let (mut state, _peer) = connection(&agent);

        let err = establisher.finalize(&mut state, &agent).await.unwrap_err();
        assert!(err.to_string().contains("read-only volume"));
        assert!(state.channel().is_none());
    }

    #[tokio::test]
    async fn test_driver_closes_sink_when_channel_ends() {
        let sinks = Arc::new(MemorySinks::default());
        let establisher = ChannelEstablisher::new(sinks.clone());
        let agent = agent();
        let (mut state, _peer) = connection(&agent);

        let channel = establisher.finalize(&mut state, &agent).await.unwrap();
        let driver = state.take_channel_driver().unwrap();
        let task = tokio::spawn(driver.run());
        channel.close("test");
        task.await.unwrap();

        assert_eq!(*sinks.closed.lock(), 1);
        assert!(sinks.lines.lock().iter().any(|line| line.contains("opened from 10.0.0.7:41000")));
    }

    #[tokio::test]
    async fn test_failing_log_writes_do_not_block_channel() {
        let sinks = Arc::new(MemorySinks {
            fail_writes: true,
            ..Default::default()
        });
        let establisher = ChannelEstablisher::new(sinks.clone());
        let agent = agent();
        let (mut state, peer) = connection(&agent);

        let channel = establisher.finalize(&mut state, &agent).await.unwrap();
        assert_eq!(agent.live_channel().map(|c| c.id()), Some(channel.id()));
        assert!(matches!(first_frame(peer).await, HandshakeResponse::Approved { .. }));

        let driver = state.take_channel_driver().unwrap();
        let task = tokio::spawn(driver.run());
        channel.close("test");
        task.await.unwrap();

        assert!(sinks.lines.lock().is_empty());
        assert_eq!(*sinks.closed.lock(), 1);
    }
}
