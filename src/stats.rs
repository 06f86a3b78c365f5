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
//! The statistic collector (C9): per-client request counters and an
//! inter-arrival window for introspection, exposed to the `show-config`
//! control command. See spec.md 3 (`ServerStatistic`) and 4.8.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::ClientId;

/// Size of the inter-arrival ring and the batch-latency sample window
/// (spec.md 3: "bounded ring of last 200 deltas").
const SAMPLE_WINDOW: usize = 200;

/// Clients are considered active if their last request landed within this
/// window (spec.md 4.8: "clients active in the last 180 s").
const ACTIVE_WINDOW: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy)]
struct BatchSample {
    batch_size: usize,
    queue_wait: Duration,
    predict_latency: Duration,
}

struct Inner {
    started_at: Instant,
    data_reqs: u64,
    sys_reqs: u64,
    total_seqs: u64,
    per_client_count: HashMap<ClientId, u64>,
    last_active_at: HashMap<ClientId, Instant>,
    last_request_at: Option<Instant>,
    inter_arrival: VecDeque<Duration>,
    /// spec.md 4.8: "the first observed request is always discarded
    /// (warmup)" -- flips true on the very first `update` call, which
    /// records no counters and seeds no inter-arrival delta.
    warmed_up: bool,
    batch_samples: VecDeque<BatchSample>,
}

/// Snapshot returned by [`StatisticCollector::snapshot`], serializable for
/// the `show-config` surface (SPEC_FULL.md 2) and for structured log
/// lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub uptime_secs: u64,
    pub data_reqs: u64,
    pub sys_reqs: u64,
    pub total_seqs: u64,
    pub num_clients: usize,
    pub active_clients: usize,
    pub requests_per_second: f64,
    pub inter_arrival_min_ms: f64,
    pub inter_arrival_max_ms: f64,
    pub inter_arrival_avg_ms: f64,
    pub inter_arrival_median_ms: f64,
    pub avg_batch_size: f64,
    pub avg_queue_wait_ms: f64,
    pub avg_predict_latency_ms: f64,
}

/// Process-wide request/batch statistics, mutated only by the
/// acceptor/control-plane thread per spec.md 4.8 and read via a brief
/// exclusive lock for a consistent snapshot.
pub struct StatisticCollector {
    inner: Mutex<Inner>,
}

impl StatisticCollector {
    pub fn new() -> Self {
        StatisticCollector {
            inner: Mutex::new(Inner {
                started_at: Instant::now(),
                data_reqs: 0,
                sys_reqs: 0,
                total_seqs: 0,
                per_client_count: HashMap::new(),
                last_active_at: HashMap::new(),
                last_request_at: None,
                inter_arrival: VecDeque::with_capacity(SAMPLE_WINDOW),
                warmed_up: false,
                batch_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            }),
        }
    }

    /// Records one accepted request from `client_id`. `is_control`
    /// distinguishes a control-plane frame (terminate/idle/switch/...)
    /// from a data request, feeding `sysReqs` vs `dataReqs` respectively
    /// (spec.md 3). The very first call across the collector's lifetime
    /// is discarded entirely as warmup noise, matching `statistic.py`'s
    /// `_ignored_first` behavior.
    pub fn record_request(&self, client_id: &ClientId, is_control: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if !inner.warmed_up {
            inner.warmed_up = true;
            inner.last_request_at = Some(now);
            return;
        }

        if let Some(prev) = inner.last_request_at.replace(now) {
            if inner.inter_arrival.len() == SAMPLE_WINDOW {
                inner.inter_arrival.pop_front();
            }
            inner.inter_arrival.push_back(now.duration_since(prev));
        }

        if is_control {
            inner.sys_reqs += 1;
        } else {
            inner.data_reqs += 1;
        }
        *inner.per_client_count.entry(client_id.clone()).or_insert(0) += 1;
        inner.last_active_at.insert(client_id.clone(), now);
    }

    /// Records one dispatched batch's size, queue wait (oldest member's
    /// age when the batch closed), and predict latency -- an enrichment
    /// over spec.md's `ServerStatistic` fields, grounded in the same
    /// "bounded ring" pattern the inter-arrival window uses. Also
    /// accumulates `totalSeqs`, the running count of individual items
    /// processed across every batch.
    pub fn record_batch(&self, batch_size: usize, queue_wait: Duration, predict_latency: Duration) {
        let mut inner = self.inner.lock();
        inner.total_seqs += batch_size as u64;
        if inner.batch_samples.len() == SAMPLE_WINDOW {
            inner.batch_samples.pop_front();
        }
        inner.batch_samples.push_back(BatchSample { batch_size, queue_wait, predict_latency });
    }

    /// Produces a point-in-time snapshot under a brief exclusive lock
    /// (spec.md 4.8).
    pub fn snapshot(&self) -> StatSnapshot {
        let inner = self.inner.lock();
        let uptime = inner.started_at.elapsed();

        let mut deltas_ms: Vec<f64> = inner.inter_arrival.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let (min_ms, max_ms, avg_ms, median_ms) = if deltas_ms.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            deltas_ms.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let sum: f64 = deltas_ms.iter().sum();
            let mid = deltas_ms.len() / 2;
            let median =
                if deltas_ms.len() % 2 == 0 { (deltas_ms[mid - 1] + deltas_ms[mid]) / 2.0 } else { deltas_ms[mid] };
            (deltas_ms[0], *deltas_ms.last().unwrap(), sum / deltas_ms.len() as f64, median)
        };

        let now = Instant::now();
        let active_clients =
            inner.last_active_at.values().filter(|&&seen| now.duration_since(seen) <= ACTIVE_WINDOW).count();

        let (avg_batch_size, avg_queue_wait_ms, avg_predict_latency_ms) = if inner.batch_samples.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let n = inner.batch_samples.len() as f64;
            let batch_sum: usize = inner.batch_samples.iter().map(|s| s.batch_size).sum();
            let wait_sum: f64 = inner.batch_samples.iter().map(|s| s.queue_wait.as_secs_f64() * 1000.0).sum();
            let latency_sum: f64 = inner.batch_samples.iter().map(|s| s.predict_latency.as_secs_f64() * 1000.0).sum();
            (batch_sum as f64 / n, wait_sum / n, latency_sum / n)
        };

        // `statistic.py`'s `value` derives requests/second as the reciprocal
        // of recent inter-arrival intervals (1/delta, averaged), which
        // tracks the recent rate rather than the lifetime average; we do
        // the same from the inter-arrival window, falling back to the
        // lifetime average before enough samples exist.
        let total_reqs = inner.data_reqs + inner.sys_reqs;
        let requests_per_second = if avg_ms > 0.0 {
            1000.0 / avg_ms
        } else if uptime.as_secs_f64() > 0.0 {
            total_reqs as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        StatSnapshot {
            uptime_secs: uptime.as_secs(),
            data_reqs: inner.data_reqs,
            sys_reqs: inner.sys_reqs,
            total_seqs: inner.total_seqs,
            num_clients: inner.per_client_count.len(),
            active_clients,
            requests_per_second,
            inter_arrival_min_ms: min_ms,
            inter_arrival_max_ms: max_ms,
            inter_arrival_avg_ms: avg_ms,
            inter_arrival_median_ms: median_ms,
            avg_batch_size,
            avg_queue_wait_ms,
            avg_predict_latency_ms,
        }
    }
}

impl Default for StatisticCollector {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn client(n: u8) -> ClientId { ClientId(Bytes::from(vec![n])) }

    #[test]
    fn first_request_is_discarded_as_warmup() {
        let stats = StatisticCollector::new();
        stats.record_request(&client(1), false);
        let snap = stats.snapshot();
        assert_eq!(snap.data_reqs, 0);
        assert_eq!(snap.num_clients, 0);
    }

    #[test]
    fn tracks_requests_per_client_after_warmup() {
        let stats = StatisticCollector::new();
        stats.record_request(&client(1), false); // warmup, discarded
        stats.record_request(&client(1), false);
        stats.record_request(&client(1), false);
        stats.record_request(&client(2), false);

        let snap = stats.snapshot();
        assert_eq!(snap.data_reqs, 3);
        assert_eq!(snap.num_clients, 2);
    }

    #[test]
    fn separates_data_and_system_requests() {
        let stats = StatisticCollector::new();
        stats.record_request(&client(1), false); // warmup
        stats.record_request(&client(1), false);
        stats.record_request(&client(1), true);

        let snap = stats.snapshot();
        assert_eq!(snap.data_reqs, 1);
        assert_eq!(snap.sys_reqs, 1);
    }

    #[test]
    fn inter_arrival_window_is_bounded() {
        let stats = StatisticCollector::new();
        for i in 0..(SAMPLE_WINDOW + 50) {
            stats.record_request(&client((i % 255) as u8), false);
        }
        let inner = stats.inner.lock();
        assert_eq!(inner.inter_arrival.len(), SAMPLE_WINDOW);
    }

    #[test]
    fn discards_warmup_batch_outlier_from_averages() {
        let stats = StatisticCollector::new();
        stats.record_batch(8, Duration::from_millis(10), Duration::from_millis(20));
        stats.record_batch(8, Duration::from_millis(10), Duration::from_millis(20));

        let snap = stats.snapshot();
        assert_eq!(snap.avg_batch_size, 8.0);
        assert_eq!(snap.total_seqs, 16);
    }

    #[test]
    fn empty_snapshot_has_zeroed_averages() {
        let stats = StatisticCollector::new();
        let snap = stats.snapshot();
        assert_eq!(snap.avg_batch_size, 0.0);
        assert_eq!(snap.total_seqs, 0);
        assert_eq!(snap.requests_per_second, 0.0);
    }
}
