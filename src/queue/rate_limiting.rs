// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Rate limited work queue used for reconciliation triggers.

use super::state::QueueState;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Deduplicating queue whose items are processed one at a time, with a
/// minimum interval between two dequeues regardless of the key.
///
/// Level triggered: adding a key that is already pending is a no-op and
/// adding a key that is being processed schedules exactly one more run.
pub struct WorkQueue<K> {
    state: Arc<QueueState<K>>,
    interval: Duration,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            interval: self.interval,
        }
    }
}

impl<K: Eq + Hash + Clone + Debug> WorkQueue<K> {
    /// Create a queue that dequeues at most once per `interval`. A zero
    /// interval disables the limit.
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(QueueState::new()),
            interval,
        }
    }

    pub fn add(&self, key: K) {
        self.state.add(key);
    }

    pub fn shut_down(&self) {
        debug!("Shutting down work queue");
        self.state.shut_down();
    }

    pub fn shutting_down(&self) -> bool {
        self.state.shutting_down()
    }

    /// Number of keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process keys with `handler` until the queue is shut down and drained.
    pub async fn run<F, Fut>(&self, handler: F)
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut next_slot: Option<Instant> = None;
        loop {
            if let Some(at) = next_slot {
                if !self.shutting_down() {
                    sleep_until(at).await;
                }
            }
            let Some((key, _)) = self.state.get().await else {
                break;
            };
            next_slot = Some(Instant::now() + self.interval);
            handler(key.clone()).await;
            self.state.done(&key);
        }
        debug!("Work queue stopped");
    }
}
