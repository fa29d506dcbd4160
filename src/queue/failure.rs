// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Work queue whose items are retried with a growing delay while they fail.

use super::backoff::ItemExponentialBackoff;
use super::state::QueueState;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue used for certificate signing. A failing item is scheduled again
/// after `initial * 2^failures` (capped at `max`); a success resets its delay.
pub struct FailureBackoffQueue<K> {
    state: Arc<QueueState<K>>,
    backoff: Arc<Mutex<ItemExponentialBackoff<K>>>,
}

impl<K> Clone for FailureBackoffQueue<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            backoff: self.backoff.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug> FailureBackoffQueue<K> {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            state: Arc::new(QueueState::new()),
            backoff: Arc::new(Mutex::new(ItemExponentialBackoff::new(initial, max))),
        }
    }

    fn backoff(&self) -> MutexGuard<'_, ItemExponentialBackoff<K>> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: K) {
        self.state.add(key);
    }

    pub fn shut_down(&self) {
        debug!("Shutting down failure backoff queue");
        self.state.shut_down();
    }

    pub fn shutting_down(&self) -> bool {
        self.state.shutting_down()
    }

    /// Drop every pending and scheduled item and forget their failures.
    /// Items being processed finish, but are not scheduled again if they fail.
    pub fn clear(&self) {
        let dropped = self.state.clear();
        self.backoff().reset();
        info!("Cleared {} pending items", dropped);
    }

    /// Number of items ready or scheduled for a retry
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consecutive failures recorded for `key`
    pub fn failures(&self, key: &K) -> u32 {
        self.backoff().failures(key)
    }

    /// Process items with `handler` until the queue is shut down and drained.
    /// An `Err` from the handler schedules the item again with backoff.
    pub async fn run<F, Fut, E>(&self, handler: F)
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        while let Some((key, generation)) = self.state.get().await {
            match handler(key.clone()).await {
                Ok(()) => {
                    self.backoff().forget(&key);
                }
                Err(e) => {
                    if self.state.generation() == generation {
                        let delay = self.backoff().when(key.clone());
                        warn!("Processing {:?} failed, retrying in {:?}: {}", key, delay, e);
                        self.state.add_after(key.clone(), delay);
                    } else {
                        debug!("Processing {:?} failed after the queue was cleared: {}", key, e);
                    }
                }
            }
            self.state.done(&key);
        }
        debug!("Failure backoff queue stopped");
    }
}
