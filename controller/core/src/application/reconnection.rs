// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Reconnection Dedup
//!
//! Decides whether a connection claiming an identity that already has a live
//! channel is the same peer reconnecting (it presents the cookie issued with
//! the live channel) or a second peer trying to take the identity over.
//!
//! `admit` calls for one identity are serialized by a per-identity async
//! mutex. The returned [`IdentityLease`] keeps that mutex held until the
//! caller has published the new channel, so two attempts can never both
//! observe "no live channel".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentName, AgentNode, Cookie};
use crate::domain::channel::{Channel, ChannelId};
use crate::domain::connection::AdmissionError;
use crate::domain::events::ConnectionEvent;
use crate::infrastructure::cookie::{cookies_match, issue_cookie};
use crate::infrastructure::event_bus::EventBus;

pub const DEFAULT_PREEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Exclusive right to mutate one identity's connection state.
pub struct IdentityLease {
    agent: AgentName,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityLease {
    pub fn agent(&self) -> &AgentName {
        &self.agent
    }
}

impl std::fmt::Debug for IdentityLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityLease").field("agent", &self.agent).finish()
    }
}

/// An approved admission.
#[derive(Debug)]
pub struct Admission {
    /// Freshly issued cookie, already recorded on the agent.
    pub cookie: Cookie,
    /// The stale channel that was closed to make room, if any.
    pub preempted: Option<ChannelId>,
    pub lease: IdentityLease,
}

pub struct ReconnectionController {
    preempt_timeout: Duration,
    locks: DashMap<AgentName, Arc<Mutex<()>>>,
    event_bus: EventBus,
}

impl ReconnectionController {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            preempt_timeout: DEFAULT_PREEMPT_TIMEOUT,
            locks: DashMap::new(),
            event_bus,
        }
    }

    pub fn with_preempt_timeout(mut self, timeout: Duration) -> Self {
        self.preempt_timeout = timeout;
        self
    }

    pub async fn lock_identity(&self, agent: &AgentName) -> IdentityLease {
        let lock = self.locks.entry(agent.clone()).or_default().clone();
        IdentityLease {
            agent: agent.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    pub async fn admit(&self, agent: &Arc<AgentNode>, presented: Option<&Cookie>) -> Result<Admission, AdmissionError> {
        let lease = self.lock_identity(agent.name()).await;

        let preempted = match agent.live_channel() {
            None => None,
            Some(stale) => {
                let same_peer = match (presented, agent.last_cookie()) {
                    (Some(presented), Some(issued)) => cookies_match(presented, &issued),
                    _ => false,
                };
                if !same_peer {
                    debug!(
                        agent = %agent.name(),
                        channel = %stale.id(),
                        cookie_presented = presented.is_some(),
                        "Identity already connected"
                    );
                    return Err(AdmissionError::IdentityAlreadyConnected(agent.name().to_string()));
                }
                self.preempt(agent, &stale).await;
                Some(stale.id())
            }
        };

        let cookie = issue_cookie();
        agent.record_cookie(cookie.clone());
        Ok(Admission {
            cookie,
            preempted,
            lease,
        })
    }

    async fn preempt(&self, agent: &AgentNode, stale: &Arc<Channel>) {
        info!(agent = %agent.name(), channel = %stale.id(), "Same peer reconnected, preempting stale channel");
        stale.close("preempted by reconnecting peer");

        if tokio::time::timeout(self.preempt_timeout, stale.terminated()).await.is_err() {
            warn!(
                agent = %agent.name(),
                channel = %stale.id(),
                "Stale channel did not acknowledge termination within {:?}, proceeding",
                self.preempt_timeout
            );
        }

        agent.clear_channel_if(stale.id());
        metrics::counter!("hangar_channels_preempted_total").increment(1);
        self.event_bus.publish_connection_event(ConnectionEvent::ChannelPreempted {
            agent: agent.name().clone(),
            channel: stale.id(),
            preempted_at: Utc::now(),
        });
    }

    /// Drop the lock entry of a removed agent unless someone holds it.
    pub fn forget(&self, agent: &AgentName) {
        self.locks.remove_if(agent, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::{frame_transport, ChannelBuilder, ChannelDriver};
    use crate::domain::connection::CloseCause;
    use crate::domain::launcher::LauncherSpec;
    use tokio::io::DuplexStream;

    fn agent() -> Arc<AgentNode> {
        Arc::new(AgentNode::new("ec2-1", Arc::new(LauncherSpec::network())))
    }

    async fn live_channel(agent: &AgentNode) -> (Arc<Channel>, ChannelDriver, DuplexStream) {
        let (controller_side, peer_side) = tokio::io::duplex(4096);
        let builder = ChannelBuilder::new(agent.name().clone(), frame_transport(Box::new(controller_side), 4096));
        let (channel, driver) = builder.build().await.unwrap();
        agent.publish_channel(channel.clone());
        (channel, driver, peer_side)
    }

    #[tokio::test]
    async fn test_admit_without_live_channel() {
        let controller = ReconnectionController::new(EventBus::new(16));
        let agent = agent();

        let admission = controller.admit(&agent, Some(&Cookie::new("anything"))).await.unwrap();
        assert!(admission.preempted.is_none());
        assert_eq!(agent.last_cookie(), Some(admission.cookie.clone()));
    }

    #[tokio::test]
    async fn test_matching_cookie_preempts_stale_channel() {
        let controller = ReconnectionController::new(EventBus::new(16));
        let agent = agent();
        let first = controller.admit(&agent, None).await.unwrap();
        drop(first.lease);

        let (stale, driver, _peer) = live_channel(&agent).await;
        let task = tokio::spawn(driver.run());

        let second = controller.admit(&agent, Some(&first.cookie)).await.unwrap();
        assert_eq!(second.preempted, Some(stale.id()));
        assert_ne!(second.cookie, first.cookie);
        assert!(stale.is_closed());
        assert!(agent.live_channel().is_none());
        assert!(matches!(task.await.unwrap(), CloseCause::Closed(_)));
    }

    #[tokio::test]
    async fn test_wrong_or_missing_cookie_is_rejected() {
        let controller = ReconnectionController::new(EventBus::new(16));
        let agent = agent();
        drop(controller.admit(&agent, None).await.unwrap());
        let (live, _driver, _peer) = live_channel(&agent).await;
        let issued = agent.last_cookie();

        for presented in [None, Some(Cookie::new("bogus"))] {
            let err = controller.admit(&agent, presented.as_ref()).await.unwrap_err();
            assert_eq!(err, AdmissionError::IdentityAlreadyConnected("ec2-1".to_string()));
        }
        assert!(!live.is_closed());
        assert_eq!(agent.live_channel().map(|c| c.id()), Some(live.id()));
        assert_eq!(agent.last_cookie(), issued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_stale_channel_times_out() {
        let controller = ReconnectionController::new(EventBus::new(16)).with_preempt_timeout(Duration::from_secs(15));
        let agent = agent();
        let first = controller.admit(&agent, None).await.unwrap();
        drop(first.lease);

        // The driver is alive but never runs, so termination is never acknowledged.
        let (stale, _driver, _peer) = live_channel(&agent).await;

        let second = controller.admit(&agent, Some(&first.cookie)).await.unwrap();
        assert_eq!(second.preempted, Some(stale.id()));
        assert!(agent.live_channel().is_none());
    }

    #[tokio::test]
    async fn test_admissions_are_serialized_per_identity() {
        let controller = Arc::new(ReconnectionController::new(EventBus::new(16)));
        let agent = agent();
        let held = controller.admit(&agent, None).await.unwrap();

        let contender = {
            let controller = controller.clone();
            let agent = agent.clone();
            tokio::spawn(async move { controller.admit(&agent, None).await.map(|a| a.cookie) })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        // Publish a channel while still holding the lease; the contender must see it.
        let (_live, _driver, _peer) = live_channel(&agent).await;
        drop(held);

        let result = contender.await.unwrap();
        assert!(matches!(result, Err(AdmissionError::IdentityAlreadyConnected(_))));
    }

    #[tokio::test]
    async fn test_forget_keeps_held_locks() {
        let controller = ReconnectionController::new(EventBus::new(16));
        let name = AgentName::from("ec2-1");
        let lease = controller.lock_identity(&name).await;
        controller.forget(&name);
        assert!(controller.locks.contains_key(&name));
        drop(lease);
        controller.forget(&name);
        assert!(!controller.locks.contains_key(&name));
    }
}
