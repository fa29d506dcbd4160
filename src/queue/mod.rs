// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Work queues driving reconciliation and certificate signing.

pub mod backoff;
pub mod failure;
pub mod rate_limiting;
mod state;

pub use backoff::ItemExponentialBackoff;
pub use failure::FailureBackoffQueue;
pub use rate_limiting::WorkQueue;
