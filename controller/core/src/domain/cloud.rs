// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Clouds and Planned Resources
//!
//! A [`Cloud`] turns a capacity request (label + executor count) into
//! [`PlannedResource`]s. Each planned resource wraps a future that resolves to
//! the launched [`AgentNode`] or fails; the provisioning coordinator consumes
//! that future exactly once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::AgentNode;

/// Label expression a capacity request is made for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operator-visible reason a provisioning or admission action was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseOfBlockage {
    /// Who refused (listener or component name).
    pub source: String,
    pub reason: String,
}

impl CauseOfBlockage {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CauseOfBlockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

/// Failure of a planned resource's launch future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct LaunchError(pub String);

impl LaunchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type LaunchResult = Result<Arc<AgentNode>, LaunchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlannedResourceId(Uuid);

impl PlannedResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlannedResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlannedResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-flight request to a cloud for a new agent.
pub struct PlannedResource {
    id: PlannedResourceId,
    cloud: String,
    label: Option<Label>,
    display_name: String,
    num_executors: u32,
    future: Mutex<Option<BoxFuture<'static, LaunchResult>>>,
}

impl PlannedResource {
    pub fn new<F>(
        cloud: impl Into<String>,
        label: Option<Label>,
        display_name: impl Into<String>,
        num_executors: u32,
        future: F,
    ) -> Self
    where
        F: Future<Output = LaunchResult> + Send + 'static,
    {
        Self {
            id: PlannedResourceId::new(),
            cloud: cloud.into(),
            label,
            display_name: display_name.into(),
            num_executors,
            future: Mutex::new(Some(future.boxed())),
        }
    }

    pub fn id(&self) -> PlannedResourceId {
        self.id
    }

    /// Name of the cloud that produced this resource.
    pub fn cloud(&self) -> &str {
        &self.cloud
    }

    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn num_executors(&self) -> u32 {
        self.num_executors
    }

    /// Takes the launch future. Returns `None` once it has been consumed.
    pub(crate) fn take_future(&self) -> Option<BoxFuture<'static, LaunchResult>> {
        self.future.lock().take()
    }
}

impl fmt::Debug for PlannedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedResource")
            .field("id", &self.id)
            .field("cloud", &self.cloud)
            .field("label", &self.label)
            .field("display_name", &self.display_name)
            .field("num_executors", &self.num_executors)
            .finish()
    }
}

/// A provisioning source.
pub trait Cloud: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this cloud can serve the label at all.
    fn can_provision(&self, _label: Option<&Label>) -> bool {
        true
    }

    /// Plan new agents for `num_executors` executors of `label`.
    fn provision(
        &self,
        label: Option<&Label>,
        num_executors: u32,
    ) -> Result<Vec<PlannedResource>, LaunchError>;
}
