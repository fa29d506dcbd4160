// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease based leader election.
//!
//! The elector runs in its own task and never calls into the subscriber
//! directly: transitions are sent as [`LeaderEvent`]s over a channel and
//! delivered by [`dispatch_events`], so a slow subscriber cannot stall
//! lease renewal.

use super::lease::{LeaseRecord, LeaseStore};
use crate::constants::lease::{LEASE_DURATION, RENEW_DEADLINE, RETRY_PERIOD};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Leadership transitions, in the order they happened
#[derive(Debug, Clone)]
pub enum LeaderEvent {
    /// This replica became the leader. The token is cancelled as soon as leadership is lost
    StartedLeading(CancellationToken),
    /// This replica is no longer the leader
    StoppedLeading,
    /// The leader changed, possibly to this replica
    NewLeader(String),
}

/// Receives leadership transitions
#[async_trait]
pub trait LeaderSubscriber: Send + Sync {
    async fn on_started_leading(&self, leading: CancellationToken);
    fn on_stopped_leading(&self);
    fn on_new_leader(&self, identity: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadershipState {
    pub is_leader: bool,
    pub current_identity: String,
}

/// Read only view of the election outcome
#[derive(Clone)]
pub struct LeadershipHandle {
    state: watch::Receiver<LeadershipState>,
}

impl LeadershipHandle {
    /// A handle whose state never changes, for single replica deployments
    pub fn fixed(is_leader: bool) -> Self {
        let (_, state) = watch::channel(LeadershipState {
            is_leader,
            current_identity: String::new(),
        });
        Self { state }
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader
    }

    pub fn current_identity(&self) -> String {
        self.state.borrow().current_identity.clone()
    }
}

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
        }
    }
}

/// What to do with the lease after reading it
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Create(LeaseRecord),
    Update(LeaseRecord),
    Follow(Option<String>),
}

fn decide(
    current: Option<&LeaseRecord>,
    config: &LeaderElectionConfig,
    now: DateTime<Utc>,
) -> Decision {
    let Some(current) = current else {
        return Decision::Create(LeaseRecord {
            holder_identity: Some(config.identity.clone()),
            lease_duration: config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
            resource_version: None,
        });
    };

    if current.holder_identity.as_deref() == Some(config.identity.as_str()) {
        return Decision::Update(LeaseRecord {
            renew_time: Some(now),
            lease_duration: config.lease_duration,
            ..current.clone()
        });
    }

    if current.holder_identity.is_some() && !current.is_expired(now) {
        return Decision::Follow(current.holder_identity.clone());
    }

    Decision::Update(LeaseRecord {
        holder_identity: Some(config.identity.clone()),
        lease_duration: config.lease_duration,
        acquire_time: Some(now),
        renew_time: Some(now),
        lease_transitions: current.lease_transitions + 1,
        resource_version: current.resource_version.clone(),
    })
}

/// Participates in the election of the replica allowed to sign certificates
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: LeaderElectionConfig,
    events: mpsc::Sender<LeaderEvent>,
    state: watch::Sender<LeadershipState>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        config: LeaderElectionConfig,
    ) -> (Self, mpsc::Receiver<LeaderEvent>) {
        let (events, events_rx) = mpsc::channel(16);
        let (state, _) = watch::channel(LeadershipState::default());

        let elector = Self {
            store,
            config,
            events,
            state,
        };
        (elector, events_rx)
    }

    pub fn handle(&self) -> LeadershipHandle {
        LeadershipHandle {
            state: self.state.subscribe(),
        }
    }

    async fn emit(&self, event: LeaderEvent) {
        if let Err(e) = self.events.send(event).await {
            error!("Failed to deliver leader election event: {}", e);
        }
    }

    /// Acquire or renew the lease, returning the identity of the current holder
    async fn try_acquire_or_renew(&self) -> Result<Option<String>> {
        let current = self.store.get().await?;
        match decide(current.as_ref(), &self.config, Utc::now()) {
            Decision::Create(record) => {
                self.store.create(&record).await?;
                Ok(record.holder_identity)
            }
            Decision::Update(record) => {
                self.store.update(&record).await?;
                Ok(record.holder_identity)
            }
            Decision::Follow(holder) => Ok(holder),
        }
    }

    async fn start_leading(&self, leading: &mut Option<CancellationToken>) {
        if leading.is_some() {
            return;
        }
        info!("Started leading as {}", self.config.identity);
        let token = CancellationToken::new();
        *leading = Some(token.clone());
        self.state.send_modify(|s| s.is_leader = true);
        self.emit(LeaderEvent::StartedLeading(token)).await;
    }

    async fn stop_leading(&self, leading: &mut Option<CancellationToken>) {
        let Some(token) = leading.take() else {
            return;
        };
        info!("Stopped leading as {}", self.config.identity);
        token.cancel();
        self.state.send_modify(|s| s.is_leader = false);
        self.emit(LeaderEvent::StoppedLeading).await;
    }

    /// Give the lease away so another replica does not need to wait for it to expire
    async fn release(&self) {
        let current = match self.store.get().await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read lease on release: {}", e);
                return;
            }
        };
        if current.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: Duration::from_secs(1),
            renew_time: Some(Utc::now()),
            ..current
        };
        match self.store.update(&released).await {
            Ok(()) => info!("Lease released"),
            Err(e) => warn!("Failed to release lease: {}", e),
        }
    }

    /// Participate in the election until `stop` is cancelled
    pub async fn run(self, stop: CancellationToken) {
        info!("Starting leader election as {}", self.config.identity);

        let mut leading: Option<CancellationToken> = None;
        let mut last_renew: Option<Instant> = None;
        let mut observed: Option<String> = None;

        loop {
            match self.try_acquire_or_renew().await {
                Ok(holder) => {
                    if holder != observed {
                        if let Some(identity) = &holder {
                            self.state
                                .send_modify(|s| s.current_identity = identity.clone());
                            self.emit(LeaderEvent::NewLeader(identity.clone())).await;
                        }
                        observed = holder.clone();
                    }
                    if holder.as_deref() == Some(self.config.identity.as_str()) {
                        last_renew = Some(Instant::now());
                        self.start_leading(&mut leading).await;
                    } else {
                        self.stop_leading(&mut leading).await;
                    }
                }
                Err(e) => {
                    warn!("Failed to acquire or renew lease: {}", e);
                    let deadline_passed =
                        last_renew.map_or(true, |at| at.elapsed() > self.config.renew_deadline);
                    if leading.is_some() && deadline_passed {
                        warn!("Lease not renewed within {:?}", self.config.renew_deadline);
                        self.stop_leading(&mut leading).await;
                    }
                }
            }

            debug!("Next election attempt in {:?}", self.config.retry_period);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        if leading.is_some() {
            self.stop_leading(&mut leading).await;
            self.release().await;
        }
        info!("Leader election stopped");
    }
}

/// Deliver leader election events to `subscriber` until the elector goes away
pub async fn dispatch_events(
    mut events: mpsc::Receiver<LeaderEvent>,
    subscriber: Arc<dyn LeaderSubscriber>,
) {
    while let Some(event) = events.recv().await {
        debug!("Handling leader event: {:?}", event);
        match event {
            LeaderEvent::StartedLeading(leading) => subscriber.on_started_leading(leading).await,
            LeaderEvent::StoppedLeading => subscriber.on_stopped_leading(),
            LeaderEvent::NewLeader(identity) => subscriber.on_new_leader(&identity),
        }
    }
}
