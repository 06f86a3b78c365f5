// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Worker cool-off tracking, layered under the spec's fail-fast-at-startup
//! `WorkerDead` contract as an additive resilience feature (spec.md 7;
//! SPEC_FULL.md 2). Repeated predict errors on a worker put it into a
//! cool-off window during which the pool treats it as unhealthy without
//! killing its task.

use std::time::{Duration, Instant};

/// Tracks a single worker's recent error rate and cool-off state.
///
/// Disabled by default per SPEC_FULL.md 2 / spec.md 9's open question
/// about `autoRespawn` -- with `cooloff_enabled: false`, `is_healthy`
/// always returns `true` and `increment_error` is a no-op.
pub struct WorkerHealth {
    cooloff_enabled: bool,
    cooloff_period: Duration,
    error_limit: usize,
    error_count: usize,
    in_cooloff: bool,
    epoch: u64,
    cooloff_done_at: Instant,
}

impl WorkerHealth {
    pub fn new(cooloff_enabled: bool, cooloff_period: Duration, error_limit: usize) -> WorkerHealth {
        tracing::debug!(cooloff_enabled, error_limit, ?cooloff_period, "worker health tracker created");

        WorkerHealth {
            cooloff_enabled,
            cooloff_period,
            error_limit,
            error_count: 0,
            in_cooloff: false,
            epoch: 0,
            cooloff_done_at: Instant::now(),
        }
    }

    /// Returns whether the worker should currently receive batches.
    /// Clears the cool-off (and bumps `epoch`) once the window has
    /// elapsed, so callers don't need a separate "check and clear" step.
    pub fn is_healthy(&mut self) -> bool {
        if !self.cooloff_enabled || !self.in_cooloff {
            return true;
        }

        if Instant::now() >= self.cooloff_done_at {
            self.error_count = 0;
            self.in_cooloff = false;
            self.epoch += 1;
            return true;
        }

        false
    }

    /// Identifies which cool-off cycle is currently active; bumped every
    /// time the worker enters or clears cool-off, so callers can detect a
    /// state transition without polling `is_healthy` in a tight loop.
    pub fn epoch(&self) -> u64 { self.epoch }

    /// Records a predict failure, entering cool-off once `error_limit` is
    /// reached.
    pub fn increment_error(&mut self) {
        if !self.cooloff_enabled {
            return;
        }

        self.error_count += 1;

        if self.error_count >= self.error_limit && !self.in_cooloff {
            tracing::debug!(error_count = self.error_count, "worker entering cooloff");
            self.in_cooloff = true;
            self.epoch += 1;
            self.cooloff_done_at = Instant::now() + self.cooloff_period;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_is_always_healthy() {
        let mut health = WorkerHealth::new(false, Duration::from_secs(60), 1);
        health.increment_error();
        health.increment_error();
        assert!(health.is_healthy());
    }

    #[test]
    fn enters_cooloff_after_error_limit() {
        let mut health = WorkerHealth::new(true, Duration::from_millis(50), 2);
        assert!(health.is_healthy());
        health.increment_error();
        assert!(health.is_healthy());
        health.increment_error();
        assert!(!health.is_healthy());
    }

    #[test]
    fn clears_cooloff_after_period_elapses() {
        let mut health = WorkerHealth::new(true, Duration::from_millis(10), 1);
        health.increment_error();
        assert!(!health.is_healthy());
        std::thread::sleep(Duration::from_millis(20));
        assert!(health.is_healthy());
        assert_eq!(health.epoch(), 2);
    }
}
