// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Provisioning Coordinator
//!
//! Drives each [`PlannedResource`] through the two-phase lifecycle:
//!
//! 1. `request_capacity` asks every listener whether provisioning may proceed.
//!    The first veto in registration order wins and later listeners are not asked.
//! 2. `notify_started` announces the planned resources.
//! 3. `await_and_commit` waits for the launch future, then either
//!    `on_complete` → register → `on_commit` / `on_rollback`,
//!    or `on_failure` when the future fails or times out.
//!
//! Listener errors and panics are caught per listener, logged, and returned
//! in the [`ProvisioningReport`]; they never change the coordinator's own
//! transition. No retries happen here; retry policy belongs to the cloud.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::listener_registry::ProvisioningListenerRegistry;
use crate::domain::agent::AgentNode;
use crate::domain::cloud::{CauseOfBlockage, Cloud, Label, LaunchError, PlannedResource, PlannedResourceId};
use crate::domain::events::ProvisioningEvent;
use crate::domain::provisioning::{
    ProvisioningError, ProvisioningListener, ProvisioningOutcome, ProvisioningPhase, ProvisioningReport,
};
use crate::domain::registry::AgentRegistry;
use crate::infrastructure::event_bus::EventBus;

pub struct ProvisioningCoordinator {
    listeners: Arc<ProvisioningListenerRegistry>,
    registry: Arc<dyn AgentRegistry>,
    event_bus: EventBus,
    commit_timeout: Option<Duration>,
}

/// Handle on a provisioning request that passed the capacity check.
pub struct ProvisioningTicket {
    pub planned: Vec<PlannedResourceId>,
    /// Isolated `on_started` failures.
    pub notification_failures: Vec<ProvisioningError>,
    tasks: Vec<JoinHandle<ProvisioningReport>>,
}

impl ProvisioningTicket {
    /// Wait for every planned resource to reach its terminal state.
    pub async fn join(self) -> Vec<ProvisioningReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match task.await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Provisioning task ended abnormally: {}", e),
            }
        }
        reports
    }
}

impl ProvisioningCoordinator {
    pub fn new(
        listeners: Arc<ProvisioningListenerRegistry>,
        registry: Arc<dyn AgentRegistry>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            listeners,
            registry,
            event_bus,
            commit_timeout: None,
        }
    }

    /// Fail planned resources whose launch future does not resolve in time.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    pub fn listeners(&self) -> &Arc<ProvisioningListenerRegistry> {
        &self.listeners
    }

    /// Returns the first blocking cause in registration order, or `None` if
    /// every listener permits the request.
    pub fn request_capacity(
        &self,
        cloud: &dyn Cloud,
        label: Option<&Label>,
        num_executors: u32,
    ) -> Option<CauseOfBlockage> {
        let cause = if cloud.can_provision(label) {
            self.first_veto(cloud, label, num_executors)
        } else {
            Some(CauseOfBlockage::new(
                cloud.name(),
                format!("cannot provision label '{}'", label.map(Label::as_str).unwrap_or("<any>")),
            ))
        }?;

        info!(cloud = cloud.name(), label = ?label.map(Label::as_str), %cause, "Provisioning blocked");
        self.event_bus.publish_provisioning_event(ProvisioningEvent::CapacityBlocked {
            cloud: cloud.name().to_string(),
            label: label.map(|l| l.as_str().to_string()),
            cause: cause.to_string(),
            blocked_at: Utc::now(),
        });
        Some(cause)
    }

    fn first_veto(&self, cloud: &dyn Cloud, label: Option<&Label>, num_executors: u32) -> Option<CauseOfBlockage> {
        for listener in self.listeners.snapshot() {
            let verdict = catch_unwind(AssertUnwindSafe(|| listener.can_provision(cloud, label, num_executors)));
            match verdict {
                Ok(None) => continue,
                Ok(Some(cause)) => return Some(cause),
                // A listener that cannot answer is treated as a veto.
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(listener = listener.name(), "can_provision panicked: {}", reason);
                    return Some(CauseOfBlockage::new(
                        listener.name(),
                        format!("listener failed: {}", reason),
                    ));
                }
            }
        }
        None
    }

    pub fn notify_started(
        &self,
        cloud: &dyn Cloud,
        label: Option<&Label>,
        planned: &[PlannedResource],
    ) -> Vec<ProvisioningError> {
        self.event_bus.publish_provisioning_event(ProvisioningEvent::ProvisioningStarted {
            cloud: cloud.name().to_string(),
            label: label.map(|l| l.as_str().to_string()),
            planned: planned.iter().map(PlannedResource::id).collect(),
            started_at: Utc::now(),
        });

        let mut failures = Vec::new();
        self.notify(ProvisioningPhase::Started, &mut failures, |listener| {
            listener.on_started(cloud, label, planned)
        });
        failures
    }

    /// Wait for the resource's launch future and drive it to a terminal state.
    pub async fn await_and_commit(&self, planned: PlannedResource) -> ProvisioningReport {
        let mut failures = Vec::new();
        let launched = self.await_launch(&planned).await;

        let outcome = match launched {
            Ok(agent) => {
                let name = agent.name().clone();
                debug!(planned = %planned.id(), agent = %name, "Planned resource launched");
                self.event_bus.publish_provisioning_event(ProvisioningEvent::ProvisioningCompleted {
                    planned: planned.id(),
                    agent: name.clone(),
                    completed_at: Utc::now(),
                });
                self.notify(ProvisioningPhase::Complete, &mut failures, |listener| {
                    listener.on_complete(&planned, &agent)
                });

                match self.registry.register_agent(agent.clone()).await {
                    Ok(()) => {
                        info!(planned = %planned.id(), agent = %name, "Agent committed");
                        metrics::counter!("hangar_provisioning_committed_total").increment(1);
                        self.event_bus.publish_provisioning_event(ProvisioningEvent::AgentCommitted {
                            planned: planned.id(),
                            agent: name.clone(),
                            committed_at: Utc::now(),
                        });
                        self.notify(ProvisioningPhase::Commit, &mut failures, |listener| {
                            listener.on_commit(&planned, &agent)
                        });
                        ProvisioningOutcome::Committed(name)
                    }
                    Err(cause) => {
                        warn!(planned = %planned.id(), agent = %name, %cause, "Agent registration failed, rolling back");
                        metrics::counter!("hangar_provisioning_rolled_back_total").increment(1);
                        self.event_bus.publish_provisioning_event(ProvisioningEvent::AgentRolledBack {
                            planned: planned.id(),
                            agent: name.clone(),
                            cause: cause.to_string(),
                            rolled_back_at: Utc::now(),
                        });
                        self.notify(ProvisioningPhase::Rollback, &mut failures, |listener| {
                            listener.on_rollback(&planned, &agent, &cause)
                        });
                        ProvisioningOutcome::RolledBack { agent: name, cause }
                    }
                }
            }
            Err(cause) => {
                warn!(planned = %planned.id(), resource = planned.display_name(), %cause, "Planned resource failed");
                metrics::counter!("hangar_provisioning_failed_total").increment(1);
                self.event_bus.publish_provisioning_event(ProvisioningEvent::ProvisioningFailed {
                    planned: planned.id(),
                    cause: cause.to_string(),
                    failed_at: Utc::now(),
                });
                self.notify(ProvisioningPhase::Failure, &mut failures, |listener| {
                    listener.on_failure(&planned, &cause)
                });
                ProvisioningOutcome::Failed(ProvisioningError::ProvisioningFutureFailed {
                    resource: planned.display_name().to_string(),
                    reason: cause.0,
                })
            }
        };

        ProvisioningReport {
            planned: planned.id(),
            display_name: planned.display_name().to_string(),
            outcome,
            notification_failures: failures,
        }
    }

    async fn await_launch(&self, planned: &PlannedResource) -> Result<Arc<AgentNode>, LaunchError> {
        let future = planned
            .take_future()
            .ok_or_else(|| LaunchError::new("launch future was already consumed"))?;

        match self.commit_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| LaunchError::new(format!("timed out after {:?}", limit)))?,
            None => future.await,
        }
    }

    /// Capacity check, planning, `on_started`, then one commit task per resource.
    pub fn provision(
        self: &Arc<Self>,
        cloud: Arc<dyn Cloud>,
        label: Option<Label>,
        num_executors: u32,
    ) -> Result<ProvisioningTicket, ProvisioningError> {
        if let Some(cause) = self.request_capacity(cloud.as_ref(), label.as_ref(), num_executors) {
            return Err(ProvisioningError::ProvisioningBlocked {
                cloud: cloud.name().to_string(),
                cause,
            });
        }

        let planned = cloud
            .provision(label.as_ref(), num_executors)
            .map_err(|e| ProvisioningError::CloudRefused {
                cloud: cloud.name().to_string(),
                reason: e.to_string(),
            })?;

        info!(
            cloud = cloud.name(),
            label = ?label.as_ref().map(Label::as_str),
            count = planned.len(),
            "Provisioning started"
        );
        let notification_failures = self.notify_started(cloud.as_ref(), label.as_ref(), &planned);

        let ids = planned.iter().map(PlannedResource::id).collect();
        let tasks = planned
            .into_iter()
            .map(|resource| {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.await_and_commit(resource).await })
            })
            .collect();

        Ok(ProvisioningTicket {
            planned: ids,
            notification_failures,
            tasks,
        })
    }

    fn notify<F>(&self, phase: ProvisioningPhase, failures: &mut Vec<ProvisioningError>, mut deliver: F)
    where
        F: FnMut(&dyn ProvisioningListener) -> anyhow::Result<()>,
    {
        for listener in self.listeners.snapshot() {
            let reason = match catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref()))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            warn!(listener = listener.name(), %phase, "Provisioning listener failed: {}", reason);
            failures.push(ProvisioningError::ListenerNotificationFailed {
                listener: listener.name().to_string(),
                phase,
                reason,
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
