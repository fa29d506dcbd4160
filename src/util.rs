// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Periodic task helpers bound to the controller stop signal.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Run `f` every `period` until `stop` is cancelled. The first run is immediate.
pub async fn until<F, Fut>(period: Duration, stop: CancellationToken, f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    jitter_until(period, 0.0, stop, f).await
}

/// Like [`until`], with each wait stretched by a random amount of up to
/// `jitter_factor * period`. The period is measured from the start of each run.
pub async fn jitter_until<F, Fut>(
    period: Duration,
    jitter_factor: f64,
    stop: CancellationToken,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if stop.is_cancelled() {
            return;
        }
        let next = Instant::now() + jittered(period, jitter_factor);
        f().await;
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep_until(next) => {}
        }
    }
}

/// `period` plus a random share of up to `factor * period`
pub fn jittered(period: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return period;
    }
    let extra = rand::rng().random_range(0.0..factor);
    period + period.mul_f64(extra)
}
