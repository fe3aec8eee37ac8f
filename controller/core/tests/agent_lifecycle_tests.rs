// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end: a cloud provisions an agent, the worker connects over TCP,
//! reconnects after a network blip, and an impostor is turned away.

use std::sync::Arc;
use std::time::Duration;

use hangar_core::application::provisioning::ProvisioningCoordinator;
use hangar_core::domain::agent::{AgentName, AgentNode};
use hangar_core::domain::cloud::{CauseOfBlockage, Cloud, Label, PlannedResource};
use hangar_core::domain::controller_config::ControllerConfigManifest;
use hangar_core::domain::events::ConnectionEvent;
use hangar_core::domain::protocol::{HandshakeResponse, COOKIE_PROPERTY};
use hangar_core::domain::provisioning::{ProvisioningListener, ProvisioningOutcome};
use hangar_core::infrastructure::cloud::TemplateCloud;
use hangar_core::infrastructure::event_bus::{DomainEvent, EventReceiver};
use hangar_core::Controller;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Default)]
struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl ProvisioningListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    fn can_provision(&self, cloud: &dyn Cloud, label: Option<&Label>, _n: u32) -> Option<CauseOfBlockage> {
        self.calls
            .lock()
            .push(format!("can_provision:{}:{}", cloud.name(), label.map(Label::as_str).unwrap_or("-")));
        None
    }

    fn on_started(&self, _cloud: &dyn Cloud, _label: Option<&Label>, planned: &[PlannedResource]) -> anyhow::Result<()> {
        self.calls.lock().push(format!("started:{}", planned.len()));
        Ok(())
    }

    fn on_complete(&self, _planned: &PlannedResource, agent: &AgentNode) -> anyhow::Result<()> {
        self.calls.lock().push(format!("complete:{}", agent.name()));
        Ok(())
    }

    fn on_commit(&self, _planned: &PlannedResource, agent: &AgentNode) -> anyhow::Result<()> {
        self.calls.lock().push(format!("commit:{}", agent.name()));
        Ok(())
    }
}

struct Worker {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Worker {
    async fn connect(address: std::net::SocketAddr, properties: serde_json::Value) -> (Self, HandshakeResponse) {
        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(format!("{}\n", properties).as_bytes()).await.unwrap();

        let mut lines = BufReader::new(reader).lines();
        let frame = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response = serde_json::from_str(&frame).unwrap();
        (Self { lines, writer }, response)
    }

    /// Read until the controller closes the socket.
    async fn closed(&mut self) -> bool {
        loop {
            match timeout(Duration::from_secs(5), self.lines.next_line()).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}

fn cookie_of(response: &HandshakeResponse) -> String {
    match response {
        HandshakeResponse::Approved { properties } => properties.get(COOKIE_PROPERTY).cloned().unwrap(),
        other => panic!("expected approval, got {:?}", other),
    }
}

async fn next_connected(events: &mut EventReceiver) {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        if let DomainEvent::Connection(ConnectionEvent::AgentConnected { .. }) = event {
            return;
        }
    }
}

fn controller(logs: &TempDir) -> Controller {
    let mut config = ControllerConfigManifest::default();
    config.spec.listener.bind_address = "127.0.0.1".to_string();
    config.spec.listener.port = 0;
    config.spec.channel.log_dir = logs.path().to_path_buf();
    Controller::from_config(config).unwrap()
}

#[tokio::test]
async fn test_ec2_agent_lifecycle() {
    let logs = TempDir::new().unwrap();
    let controller = controller(&logs);
    let listener = Arc::new(RecordingListener::default());
    controller.listeners().register(listener.clone());
    let mut events = controller.event_bus().subscribe();

    // Provision one linux agent from "ec2"
    let coordinator: &Arc<ProvisioningCoordinator> = controller.coordinator();
    let ticket = coordinator
        .provision(Arc::new(TemplateCloud::new("ec2", "ec2")), Some(Label::new("linux")), 1)
        .unwrap();
    assert_eq!(ticket.planned.len(), 1);
    assert!(ticket.notification_failures.is_empty());

    let reports = ticket.join().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, ProvisioningOutcome::Committed(AgentName::from("ec2-1")));
    assert_eq!(
        *listener.calls.lock(),
        vec!["can_provision:ec2:linux", "started:1", "complete:ec2-1", "commit:ec2-1"]
    );

    let tcp = controller.bind().await.unwrap();
    let address = tcp.local_addr().unwrap();
    let dispatcher = controller.dispatcher().clone();
    let server = tokio::spawn(async move { dispatcher.serve(tcp).await });

    // The real worker connects without a cookie
    let (mut first, response) = Worker::connect(address, serde_json::json!({"Agent-Name": "ec2-1"})).await;
    let k1 = cookie_of(&response);
    next_connected(&mut events).await;

    // Network blip: the same worker reconnects with K1 and replaces the channel
    let (mut second, response) =
        Worker::connect(address, serde_json::json!({"Agent-Name": "ec2-1", "Cookie": k1.clone()})).await;
    let k2 = cookie_of(&response);
    assert_ne!(k1, k2);
    assert!(first.closed().await);
    next_connected(&mut events).await;

    let agent = controller.registry().lookup_agent(&AgentName::from("ec2-1")).await.unwrap();
    assert!(agent.is_online());
    assert_eq!(agent.last_cookie().map(|c| c.as_str().to_string()), Some(k2.clone()));

    // An impostor with a made-up cookie is turned away
    let (_third, response) =
        Worker::connect(address, serde_json::json!({"Agent-Name": "ec2-1", "Cookie": "bogus"})).await;
    match response {
        HandshakeResponse::Rejected { cause, .. } => assert_eq!(cause, "already-connected"),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(agent.is_online());

    // The surviving channel still carries frames
    let live = agent.live_channel().unwrap();
    live.send("build #42").await.unwrap();
    let frame = timeout(Duration::from_secs(5), second.lines.next_line()).await.unwrap().unwrap();
    assert_eq!(frame.as_deref(), Some("build #42"));
    second.writer.write_all(b"ping\n").await.unwrap();
    let frame = timeout(Duration::from_secs(5), second.lines.next_line()).await.unwrap().unwrap();
    assert_eq!(frame.as_deref(), Some("pong"));

    controller.shutdown().await;
    server.await.unwrap().unwrap();
    assert!(second.closed().await);
    assert!(!agent.is_online());
}

#[tokio::test]
async fn test_unknown_worker_is_rejected_over_tcp() {
    let logs = TempDir::new().unwrap();
    let controller = controller(&logs);
    let tcp = controller.bind().await.unwrap();
    let address = tcp.local_addr().unwrap();
    let dispatcher = controller.dispatcher().clone();
    let server = tokio::spawn(async move { dispatcher.serve(tcp).await });

    let (mut worker, response) = Worker::connect(address, serde_json::json!({"Agent-Name": "ec2-9"})).await;
    match response {
        HandshakeResponse::Rejected { cause, message } => {
            assert_eq!(cause, "unknown-agent");
            assert!(message.contains("ec2-9"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(worker.closed().await);

    controller.shutdown().await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_clean_reconnect_after_disconnect() {
    let logs = TempDir::new().unwrap();
    let mut config = ControllerConfigManifest::default();
    config.spec.listener.bind_address = "127.0.0.1".to_string();
    config.spec.listener.port = 0;
    config.spec.channel.log_dir = logs.path().to_path_buf();
    config.spec.agents = serde_yaml::from_str("- name: build-1\n").unwrap();
    let controller = Controller::from_config(config).unwrap();
    controller.register_declared_agents().await.unwrap();

    let mut events = controller.event_bus().subscribe();
    let tcp = controller.bind().await.unwrap();
    let address = tcp.local_addr().unwrap();
    let dispatcher = controller.dispatcher().clone();
    let server = tokio::spawn(async move { dispatcher.serve(tcp).await });

    let (first, response) = Worker::connect(address, serde_json::json!({"Agent-Name": "build-1"})).await;
    let k1 = cookie_of(&response);
    next_connected(&mut events).await;
    drop(first);

    // Wait until the controller notices the drop
    loop {
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        if let DomainEvent::Connection(ConnectionEvent::AgentDisconnected { cause, .. }) = event {
            assert_eq!(cause, "closed by peer");
            break;
        }
    }

    // Presenting the old cookie after a clean close is still approved
    let (_again, response) = Worker::connect(address, serde_json::json!({"Agent-Name": "build-1", "Cookie": k1})).await;
    cookie_of(&response);

    // The log transcript records both channels
    let transcript = std::fs::read_to_string(logs.path().join("build-1.log")).unwrap();
    assert!(transcript.contains("terminated: closed by peer"));

    controller.shutdown().await;
    server.await.unwrap().unwrap();
}
