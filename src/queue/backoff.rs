// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Per item exponential backoff: `initial * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialBackoff<K> {
    initial: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash> ItemExponentialBackoff<K> {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: HashMap::new(),
        }
    }

    /// Register one more failure of `key` and return how long to wait before retrying it
    pub fn when(&mut self, key: K) -> Duration {
        let failures = self.failures.entry(key).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);
        self.delay_for(exp)
    }

    /// Delay applied after `exp` previous failures
    fn delay_for(&self, exp: u32) -> Duration {
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Forget the failures of `key`, the next failure starts again at the initial delay
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}
