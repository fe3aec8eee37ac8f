// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Template-driven cloud: stamps out identical agents from one launcher template.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::domain::agent::AgentNode;
use crate::domain::cloud::{Cloud, Label, LaunchError, PlannedResource};
use crate::domain::launcher::LauncherSpec;

pub struct TemplateCloud {
    name: String,
    prefix: String,
    template: LauncherSpec,
    executors_per_agent: u32,
    labels: Vec<Label>,
    launch_delay: Option<Duration>,
    launch_failure: Option<String>,
    sequence: AtomicU64,
}

impl TemplateCloud {
    /// Agents are named `<prefix>-<n>`, `n` counting from 1 per cloud.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            template: LauncherSpec::network(),
            executors_per_agent: 1,
            labels: Vec::new(),
            launch_delay: None,
            launch_failure: None,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_template(mut self, template: LauncherSpec) -> Self {
        self.template = template;
        self
    }

    pub fn with_executors_per_agent(mut self, executors: u32) -> Self {
        self.executors_per_agent = executors.max(1);
        self
    }

    /// Restrict the cloud to these labels. Unrestricted when empty.
    pub fn with_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.labels = labels.into_iter().collect();
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = Some(delay);
        self
    }

    /// Make every launch future fail with `reason`.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.launch_failure = Some(reason.into());
        self
    }
}

impl Cloud for TemplateCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_provision(&self, label: Option<&Label>) -> bool {
        match label {
            Some(label) => self.labels.is_empty() || self.labels.contains(label),
            None => true,
        }
    }

    fn provision(&self, label: Option<&Label>, num_executors: u32) -> Result<Vec<PlannedResource>, LaunchError> {
        let count = num_executors.div_ceil(self.executors_per_agent);
        debug!(cloud = %self.name, count, "Planning agents");

        let planned = (0..count)
            .map(|_| {
                let index = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                let agent_name = format!("{}-{}", self.prefix, index);
                let agent = AgentNode::new(agent_name.as_str(), Arc::new(self.template.clone()))
                    .with_executors(self.executors_per_agent)
                    .with_labels(label.map(|l| l.as_str().to_string()));
                let delay = self.launch_delay;
                let failure = self.launch_failure.clone();

                PlannedResource::new(
                    self.name.clone(),
                    label.cloned(),
                    agent_name,
                    self.executors_per_agent,
                    async move {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        match failure {
                            Some(reason) => Err(LaunchError::new(reason)),
                            None => Ok(Arc::new(agent)),
                        }
                    },
                )
            })
            .collect();

        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plans_ceil_of_executors() {
        let cloud = TemplateCloud::new("ec2", "ec2").with_executors_per_agent(4);
        let planned = cloud.provision(Some(&Label::new("linux")), 9).unwrap();
        let names: Vec<_> = planned.iter().map(|p| p.display_name().to_string()).collect();
        assert_eq!(names, vec!["ec2-1", "ec2-2", "ec2-3"]);
        assert!(cloud.provision(None, 0).unwrap().is_empty());

        let agent = planned[0].take_future().unwrap().await.unwrap();
        assert_eq!(agent.name().as_str(), "ec2-1");
        assert_eq!(agent.labels(), ["linux".to_string()]);
        assert_eq!(agent.num_executors(), 4);
    }

    #[tokio::test]
    async fn test_failing_cloud() {
        let cloud = TemplateCloud::new("ec2", "ec2").failing("quota exceeded");
        let planned = cloud.provision(None, 1).unwrap();
        let err = planned[0].take_future().unwrap().await.unwrap_err();
        assert_eq!(err, LaunchError::new("quota exceeded"));
    }

    #[test]
    fn test_label_restriction() {
        let cloud = TemplateCloud::new("ec2", "ec2").with_labels([Label::new("linux")]);
        assert!(cloud.can_provision(Some(&Label::new("linux"))));
        assert!(!cloud.can_provision(Some(&Label::new("windows"))));
        assert!(cloud.can_provision(None));
    }
}
