// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease storage backing the leader election.

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use std::time::Duration;
use tracing::{debug, instrument};

/// Snapshot of the election lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
    /// Version the record was read at, updates fail if the lease changed since
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Whether the current holder failed to renew in time
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.renew_time, chrono::Duration::from_std(self.lease_duration)) {
            (Some(renewed), Ok(duration)) => renewed + duration <= now,
            _ => true,
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>>;
    async fn create(&self, record: &LeaseRecord) -> Result<()>;
    /// Compare-and-swap update, based on the record's resource version
    async fn update(&self, record: &LeaseRecord) -> Result<()>;
}

/// Lease store using a `coordination.k8s.io/v1` Lease object
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: record.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }
}

fn from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity.filter(|h| !h.is_empty()),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version,
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    #[instrument(skip(self), fields(lease = %self.name))]
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        let lease = self.api.get_opt(&self.name).await?;
        Ok(lease.map(from_lease))
    }

    #[instrument(skip(self, record), fields(lease = %self.name))]
    async fn create(&self, record: &LeaseRecord) -> Result<()> {
        let mut lease = self.to_lease(record);
        lease.metadata.resource_version = None;
        self.api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| ControllerError::LeaseError(format!("Failed to create lease: {}", e)))?;
        debug!("Lease created");
        Ok(())
    }

    #[instrument(skip(self, record), fields(lease = %self.name))]
    async fn update(&self, record: &LeaseRecord) -> Result<()> {
        let lease = self.to_lease(record);
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(|e| ControllerError::LeaseError(format!("Failed to update lease: {}", e)))?;
        Ok(())
    }
}
