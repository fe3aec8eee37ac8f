// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Launchers
//!
//! A launcher describes how an agent is started or connected. Launchers may
//! wrap one another (retry wrappers, cloud-specific decorators, ...), so the
//! configured launcher is a chain. Each link exposes its delegate through
//! [`Launcher::inner`]; walking the chain is a plain loop bounded by a maximum
//! depth so a misbehaving implementation cannot loop forever.
//!
//! [`LauncherSpec`] is the serializable form used by configuration files and
//! cloud templates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default bound on delegation depth when walking a launcher chain.
pub const DEFAULT_MAX_LAUNCHER_DEPTH: usize = 16;

/// Capability tag advertised by a launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// Expects the agent process to open the connection to the controller.
    NetworkAgent,
    /// Wraps another launcher and forwards to it.
    Delegating,
    /// Starts the agent by running a local command.
    Command,
    /// Anything else; never accepted as a network agent terminal.
    Other,
}

/// How an agent is launched. Implementations that wrap another launcher must
/// return it from [`Launcher::inner`].
pub trait Launcher: Send + Sync + fmt::Debug {
    fn kind(&self) -> LauncherKind;

    fn display_name(&self) -> String;

    fn inner(&self) -> Option<&dyn Launcher> {
        None
    }
}

/// What to do when a launcher chain ends without reaching a network agent launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherPolicy {
    /// Reject the connection.
    #[default]
    Strict,
    /// Accept with a warning. Tolerates wrappers that do not expose their delegate.
    Lenient,
}

impl std::str::FromStr for LauncherPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown launcher policy '{}', expected strict or lenient", other)),
        }
    }
}

/// Serializable launcher description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LauncherSpec {
    /// Inbound network agent: the worker connects to the controller.
    Network {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_dir: Option<String>,
    },
    /// Controller-side command that starts the agent.
    Command { command: String },
    /// Named wrapper around another launcher.
    Delegating { name: String, inner: Box<LauncherSpec> },
    /// Wrapper that does not advertise its delegate.
    Opaque { name: String },
}

impl LauncherSpec {
    pub fn network() -> Self {
        Self::Network {
            tunnel: None,
            work_dir: None,
        }
    }

    pub fn wrap(name: impl Into<String>, inner: LauncherSpec) -> Self {
        Self::Delegating {
            name: name.into(),
            inner: Box::new(inner),
        }
    }
}

impl Launcher for LauncherSpec {
    fn kind(&self) -> LauncherKind {
        match self {
            Self::Network { .. } => LauncherKind::NetworkAgent,
            Self::Command { .. } => LauncherKind::Command,
            Self::Delegating { .. } => LauncherKind::Delegating,
            Self::Opaque { .. } => LauncherKind::Other,
        }
    }

    fn display_name(&self) -> String {
        match self {
            Self::Network { tunnel: Some(tunnel), .. } => format!("network (tunnel {})", tunnel),
            Self::Network { .. } => "network".to_string(),
            Self::Command { command } => format!("command `{}`", command),
            Self::Delegating { name, .. } => name.clone(),
            Self::Opaque { name } => name.clone(),
        }
    }

    fn inner(&self) -> Option<&dyn Launcher> {
        match self {
            Self::Delegating { inner, .. } => Some(inner.as_ref()),
            _ => None,
        }
    }
}

/// Display names of the chain starting at `launcher`, outermost first.
pub fn describe_chain(launcher: &dyn Launcher, max_depth: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = Some(launcher);
    while let Some(link) = current {
        if names.len() >= max_depth {
            break;
        }
        names.push(link.display_name());
        current = link.inner();
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegating_exposes_inner() {
        let spec = LauncherSpec::wrap("retry", LauncherSpec::network());
        assert_eq!(spec.kind(), LauncherKind::Delegating);
        let inner = spec.inner().unwrap();
        assert_eq!(inner.kind(), LauncherKind::NetworkAgent);
        assert!(inner.inner().is_none());
    }

    #[test]
    fn test_describe_chain_outermost_first() {
        let spec = LauncherSpec::wrap(
            "retry",
            LauncherSpec::wrap("ec2-decorator", LauncherSpec::network()),
        );
        assert_eq!(describe_chain(&spec, 16), vec!["retry", "ec2-decorator", "network"]);
        assert_eq!(describe_chain(&spec, 2), vec!["retry", "ec2-decorator"]);
    }

    #[test]
    fn test_launcher_spec_yaml() {
        let yaml = r#"
kind: delegating
name: retry
inner:
  kind: network
  tunnel: "proxy:50000"
"#;
        let spec: LauncherSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            spec,
            LauncherSpec::wrap(
                "retry",
                LauncherSpec::Network {
                    tunnel: Some("proxy:50000".to_string()),
                    work_dir: None
                }
            )
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("STRICT".parse::<LauncherPolicy>(), Ok(LauncherPolicy::Strict));
        assert_eq!("lenient".parse::<LauncherPolicy>(), Ok(LauncherPolicy::Lenient));
        assert!("sometimes".parse::<LauncherPolicy>().is_err());
        assert_eq!(LauncherPolicy::default(), LauncherPolicy::Strict);
    }
}
