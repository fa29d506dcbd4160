// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Leader election gating certificate signing.

pub mod elector;
pub mod lease;

pub use elector::{
    dispatch_events, LeaderElectionConfig, LeaderElector, LeaderEvent, LeaderSubscriber,
    LeadershipHandle, LeadershipState,
};
pub use lease::{KubeLeaseStore, LeaseRecord, LeaseStore};
