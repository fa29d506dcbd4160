// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Deduplicating queue state shared by the work queue flavours.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

struct State<K> {
    /// Keys ready to be handed out, in enqueue order
    ready: VecDeque<K>,
    /// Keys that need processing, either ready or waiting for the current run to finish
    dirty: HashSet<K>,
    /// Keys currently handed out to the processing function
    processing: HashSet<K>,
    /// Keys scheduled for later, with their eligible time
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
    /// Bumped on every clear, lets callers discard work taken before the clear
    generation: u64,
}

impl<K: Eq + Hash + Clone> State<K> {
    fn insert(&mut self, key: K) {
        if self.dirty.contains(&key) {
            return;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return;
        }
        self.ready.push_back(key);
    }

    fn promote_expired(&mut self, now: Instant) {
        let expired: Vec<K> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.waiting.remove(&key);
            self.insert(key);
        }
    }
}

pub(crate) struct QueueState<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone> QueueState<K> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
                generation: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // state is left consistent between statements, a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add(&self, key: K) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.insert(key);
        }
        self.notify.notify_one();
    }

    pub(crate) fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let at = Instant::now() + delay;
            state
                .waiting
                .entry(key)
                .and_modify(|current| *current = (*current).min(at))
                .or_insert(at);
        }
        self.notify.notify_one();
    }

    /// Wait for the next eligible key. Returns `None` once shut down and no ready key is left.
    pub(crate) async fn get(&self) -> Option<(K, u64)> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let next_at = {
                let mut state = self.lock();
                state.promote_expired(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some((key, state.generation));
                }
                if state.shutting_down {
                    return None;
                }
                state.waiting.values().min().copied()
            };

            match next_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key handed out by `get` as processed, re-queueing it if it was added meanwhile
    pub(crate) fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    pub(crate) fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Drop every ready and scheduled key
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.ready.len() + state.waiting.len();
        state.ready.clear();
        state.waiting.clear();
        state.dirty.clear();
        state.generation += 1;
        dropped
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of keys ready or scheduled, in-flight keys excluded
    pub(crate) fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.waiting.len()
    }
}
