// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Controller Configuration Types
//
// Defines the configuration schema for a Hangar controller:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Agent listener and handshake settings
// - Admission policy (launcher validation, reconnection preemption)
// - Channel settings (log directory, heartbeats, frame limits)
// - Statically declared agents
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::agent::AgentNode;
use crate::domain::launcher::{LauncherPolicy, LauncherSpec, DEFAULT_MAX_LAUNCHER_DEPTH};
use crate::domain::protocol::DEFAULT_MAX_FRAME_LENGTH;

pub const API_VERSION: &str = "hangar.dev/v1";
pub const KIND: &str = "ControllerConfig";

const MIN_FRAME_LENGTH: usize = 1024;

/// Top-level Kubernetes-style controller configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfigManifest {
    /// API version (must be "hangar.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ControllerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: ControllerConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigSpec {
    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// Agents known to the controller at startup
    #[serde(default)]
    pub agents: Vec<AgentDeclaration>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Agent listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds a peer has to send its properties frame
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Whether an exhausted launcher chain without a network launcher is rejected
    #[serde(default)]
    pub launcher_policy: LauncherPolicy,

    #[serde(default = "default_max_launcher_depth")]
    pub max_launcher_depth: usize,

    /// Seconds to wait for a preempted channel to acknowledge termination
    #[serde(default = "default_preempt_timeout")]
    pub preempt_timeout_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            launcher_policy: LauncherPolicy::default(),
            max_launcher_depth: default_max_launcher_depth(),
            preempt_timeout_secs: default_preempt_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Directory holding one transcript file per agent
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Controller-initiated ping interval; disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,

    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            heartbeat_interval_secs: None,
            max_frame_length: default_max_frame_length(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of registered agents (unbounded when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeclaration {
    pub name: String,

    #[serde(default = "LauncherSpec::network")]
    pub launcher: LauncherSpec,

    #[serde(default = "default_num_executors")]
    pub num_executors: u32,

    #[serde(default)]
    pub labels: Vec<String>,
}

impl AgentDeclaration {
    pub fn to_agent(&self) -> AgentNode {
        AgentNode::new(self.name.as_str(), Arc::new(self.launcher.clone()))
            .with_executors(self.num_executors)
            .with_labels(self.labels.iter().cloned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    50000
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_max_launcher_depth() -> usize {
    DEFAULT_MAX_LAUNCHER_DEPTH
}

fn default_preempt_timeout() -> u64 {
    15
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/hangar/logs")
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_num_executors() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ControllerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "hangar-controller".to_string(),
                labels: None,
            },
            spec: ControllerConfigSpec::default(),
        }
    }
}

impl ControllerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Candidate locations, in discovery order
    /// 1. HANGAR_CONFIG_PATH environment variable
    /// 2. ./hangar-config.yaml (working directory)
    /// 3. ~/.hangar/config.yaml (user home)
    /// 4. /etc/hangar/config.yaml (system, Unix) or C:\ProgramData\Hangar\config.yaml (Windows)
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var("HANGAR_CONFIG_PATH") {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from("./hangar-config.yaml"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".hangar").join("config.yaml"));
        }
        #[cfg(unix)]
        paths.push(PathBuf::from("/etc/hangar/config.yaml"));
        #[cfg(windows)]
        paths.push(PathBuf::from("C:\\ProgramData\\Hangar\\config.yaml"));
        paths
    }

    pub fn discover_config() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|path| path.exists())
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails hard if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("HANGAR_LAUNCHER_POLICY") {
            match val.parse::<LauncherPolicy>() {
                Ok(policy) => {
                    tracing::info!("Environment override: HANGAR_LAUNCHER_POLICY={}", val);
                    self.spec.admission.launcher_policy = policy;
                }
                Err(e) => tracing::warn!("Invalid value for HANGAR_LAUNCHER_POLICY: {}. Ignoring.", e),
            }
        }

        if let Some(val) = lookup("HANGAR_LISTENER_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: HANGAR_LISTENER_PORT={}", port);
                    self.spec.listener.port = port;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for HANGAR_LISTENER_PORT: '{}'. Expected a port number. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let admission = &self.spec.admission;
        if admission.max_launcher_depth < 1 {
            anyhow::bail!("spec.admission.max_launcher_depth must be at least 1");
        }
        if admission.preempt_timeout_secs < 1 {
            anyhow::bail!("spec.admission.preempt_timeout_secs must be at least 1");
        }

        if self.spec.listener.handshake_timeout_secs < 1 {
            anyhow::bail!("spec.listener.handshake_timeout_secs must be at least 1");
        }

        if self.spec.channel.max_frame_length < MIN_FRAME_LENGTH {
            anyhow::bail!(
                "spec.channel.max_frame_length must be at least {} bytes",
                MIN_FRAME_LENGTH
            );
        }
        if self.spec.channel.heartbeat_interval_secs == Some(0) {
            anyhow::bail!("spec.channel.heartbeat_interval_secs must be positive when set");
        }

        let mut seen = HashSet::new();
        for agent in &self.spec.agents {
            if agent.name.trim().is_empty() {
                anyhow::bail!("Agent name cannot be empty");
            }
            if agent.name.trim() != agent.name {
                anyhow::bail!("Agent name '{}' has leading or trailing whitespace", agent.name);
            }
            if !seen.insert(agent.name.as_str()) {
                anyhow::bail!("Duplicate agent name: {}", agent.name);
            }
        }

        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.listener.handshake_timeout_secs)
    }

    pub fn preempt_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.admission.preempt_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.spec.channel.heartbeat_interval_secs.map(Duration::from_secs)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.spec.listener.bind_address, self.spec.listener.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::launcher::{Launcher, LauncherKind};

    #[test]
    fn test_default_manifest() {
        let manifest = ControllerConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.admission.launcher_policy, LauncherPolicy::Strict);
        assert_eq!(manifest.spec.listener.port, 50000);
        assert!(manifest.heartbeat_interval().is_none());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
apiVersion: hangar.dev/v1
kind: ControllerConfig
metadata:
  name: ci-controller
spec:
  listener:
    port: 50123
  admission:
    launcher_policy: lenient
    max_launcher_depth: 4
  channel:
    log_dir: /tmp/hangar-logs
    heartbeat_interval_secs: 30
  agents:
    - name: build-1
      launcher:
        kind: delegating
        name: retry
        inner:
          kind: network
    - name: build-2
      num_executors: 4
      labels: [linux, x86_64]
"#;
        let manifest = ControllerConfigManifest::from_yaml_str(yaml).unwrap();
        manifest.validate().unwrap();

        assert_eq!(manifest.listen_address(), "0.0.0.0:50123");
        assert_eq!(manifest.spec.admission.launcher_policy, LauncherPolicy::Lenient);
        assert_eq!(manifest.spec.admission.max_launcher_depth, 4);
        assert_eq!(manifest.heartbeat_interval(), Some(Duration::from_secs(30)));

        let first = manifest.spec.agents[0].to_agent();
        assert_eq!(first.launcher().kind(), LauncherKind::Delegating);
        let second = manifest.spec.agents[1].to_agent();
        assert_eq!(second.launcher().kind(), LauncherKind::NetworkAgent);
        assert_eq!(second.num_executors(), 4);
        assert_eq!(second.labels(), ["linux".to_string(), "x86_64".to_string()]);
    }

    #[test]
    fn test_validation() {
        let mut manifest = ControllerConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.spec.admission.max_launcher_depth = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.admission.max_launcher_depth = 8;

        manifest.spec.channel.max_frame_length = 16;
        assert!(manifest.validate().is_err());
        manifest.spec.channel.max_frame_length = DEFAULT_MAX_FRAME_LENGTH;

        let declaration = AgentDeclaration {
            name: "build-1".to_string(),
            launcher: LauncherSpec::network(),
            num_executors: 1,
            labels: vec![],
        };
        manifest.spec.agents = vec![declaration.clone(), declaration];
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_padded_agent_name_is_refused() {
        let mut manifest = ControllerConfigManifest::default();
        manifest.spec.agents = vec![AgentDeclaration {
            name: " build-1".to_string(),
            launcher: LauncherSpec::network(),
            num_executors: 1,
            labels: vec![],
        }];

        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("whitespace"));

        manifest.spec.agents[0].name = "build-1".to_string();
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let mut manifest = ControllerConfigManifest::default();
        manifest.apply_overrides_from(|key| match key {
            "HANGAR_LAUNCHER_POLICY" => Some("lenient".to_string()),
            "HANGAR_LISTENER_PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert_eq!(manifest.spec.admission.launcher_policy, LauncherPolicy::Lenient);
        assert_eq!(manifest.spec.listener.port, 50000);
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(ControllerConfigManifest::load_or_default(Some(missing)).is_err());

        let path = dir.path().join("hangar.yaml");
        ControllerConfigManifest::default().to_yaml_file(&path).unwrap();
        let loaded = ControllerConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "hangar-controller");
    }
}
