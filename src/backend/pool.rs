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
//! The worker pool (C4): owns N aggregator tasks, one per device, and the
//! channel that feeds them. Replaces `backend/backend.rs`'s
//! `Backend`/`BackendSupervisor` pair -- same facade-over-a-task shape,
//! generalized from "N TCP backend connections" to "N batching workers".
//! See spec.md 4.4.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregator::{self, AggregatorConfig, Reply};
use crate::backend::device::{map_devices, DeviceHint, DeviceProbe};
use crate::backend::health::WorkerHealth;
use crate::common::{DeviceId, QueuedRequest};
use crate::compute::Compute;
use crate::errors::CreationError;
use crate::reply_table::PendingReplyTable;
use crate::stats::StatisticCollector;

/// Point-in-time view of one worker, published through `ArcSwap` so
/// readers (e.g. `show-config`) never block a running aggregator.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub index: usize,
    pub device: DeviceId,
    pub healthy: bool,
}

struct Worker {
    inbox: mpsc::Sender<QueuedRequest>,
    task: JoinHandle<()>,
    health: Arc<parking_lot::Mutex<WorkerHealth>>,
    descriptor: Arc<ArcSwap<WorkerDescriptor>>,
}

/// Owns every worker for one model. Requests are handed to workers by
/// round robin over `submit`; a worker that dies (its task panics or
/// returns) is detected via `JoinHandle` but, per spec.md 4.4's
/// fail-fast-at-startup contract, the pool does not auto-respawn it --
/// `isReady` simply stops counting it among the ready set.
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: std::sync::atomic::AtomicUsize,
}

/// How aggressively to cool a worker down after repeated predict failures
/// (SPEC_FULL.md 2). Disabled by default.
#[derive(Debug, Clone)]
pub struct CooloffConfig {
    pub enabled: bool,
    pub period: Duration,
    pub error_limit: usize,
}

impl Default for CooloffConfig {
    fn default() -> Self { CooloffConfig { enabled: false, period: Duration::from_secs(10), error_limit: 5 } }
}

impl WorkerPool {
    /// Spawns `num_workers` aggregator tasks, one per mapped device.
    /// Fails at construction (never partially) if `num_workers` is zero --
    /// per spec.md 4.4, a pool with no workers can never become ready.
    pub fn new<C: Compute>(
        compute: Arc<C>, num_workers: usize, device_hint: &DeviceHint, device_probe: &dyn DeviceProbe,
        agg_config: AggregatorConfig, cooloff: CooloffConfig, inbox_capacity: usize,
        reply_table: Arc<PendingReplyTable<Reply>>, stats: Arc<StatisticCollector>,
    ) -> Result<Self, CreationError> {
        if num_workers == 0 {
            return Err(CreationError::InvalidParameter("num_workers must be >= 1".to_string()));
        }

        let devices = map_devices(num_workers, device_hint, device_probe);
        let mut workers = Vec::with_capacity(num_workers);

        for (index, device) in devices.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(inbox_capacity);
            let health = Arc::new(parking_lot::Mutex::new(WorkerHealth::new(
                cooloff.enabled,
                cooloff.period,
                cooloff.error_limit,
            )));
            let descriptor = Arc::new(ArcSwap::from_pointee(WorkerDescriptor { index, device, healthy: true }));

            let task_compute = compute.clone();
            let task_reply_table = reply_table.clone();
            let task_stats = stats.clone();
            let task_health = health.clone();
            let task_descriptor = descriptor.clone();
            let task_config = agg_config.clone();

            let task = tokio::spawn(async move {
                aggregator::run(task_compute, rx, task_reply_table, task_stats, task_health.clone(), task_config)
                    .await;
                task_descriptor.store(Arc::new(WorkerDescriptor { index, device, healthy: false }));
                tracing::info!(index, device, "worker aggregator exited");
            });

            workers.push(Worker { inbox: tx, task, health, descriptor });
        }

        Ok(WorkerPool { workers, next: std::sync::atomic::AtomicUsize::new(0) })
    }

    /// Hands one request to the next worker in round-robin order. Returns
    /// an error if every worker's inbox is gone (the pool is shut down).
    pub async fn submit(&self, req: QueuedRequest) -> Result<(), QueuedRequest> {
        use std::sync::atomic::Ordering;

        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[start];
        worker.inbox.send(req).await.map_err(|e| e.0)
    }

    /// True only once every spawned worker is alive and not cooling off,
    /// per spec.md 4.4 step 3 ("isReady() returns true only when all
    /// descriptors are Ready"). A single dead or cooled-off worker holds
    /// the whole pool not-ready.
    pub fn is_ready(&self) -> bool {
        self.workers.iter().all(|w| !w.task.is_finished() && w.health.lock().is_healthy())
    }

    /// Snapshot of every worker's current descriptor, refreshing the
    /// health flag against the live cool-off tracker.
    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.workers
            .iter()
            .map(|w| {
                let mut current = (**w.descriptor.load()).clone();
                current.healthy = !w.task.is_finished() && w.health.lock().is_healthy();
                current
            })
            .collect()
    }

    pub fn num_workers(&self) -> usize { self.workers.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::NoDevices;
    use crate::errors::PredictError;
    use bytes::Bytes;
    use matches::matches;

    struct Identity;

    impl Compute for Identity {
        type Item = Vec<u8>;

        fn preprocess(&self, raw: &[u8]) -> Result<Self::Item, PredictError> { Ok(raw.to_vec()) }

        fn predict(&self, batch: Vec<Self::Item>) -> Result<Vec<Self::Item>, PredictError> { Ok(batch) }

        fn postprocess(&self, item: Self::Item) -> Vec<u8> { item }
    }

    fn pool(num_workers: usize) -> WorkerPool {
        WorkerPool::new(
            Arc::new(Identity),
            num_workers,
            &DeviceHint::Auto,
            &NoDevices,
            AggregatorConfig {
                batch_size: 4,
                batch_timeout: Duration::from_millis(5),
                timeout_semantics: aggregator::BatchTimeoutSemantics::FromLastPull,
                on_shape_mismatch: aggregator::OnShapeMismatch::PadError,
            },
            CooloffConfig::default(),
            16,
            Arc::new(PendingReplyTable::new()),
            Arc::new(StatisticCollector::new()),
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_workers() {
        let err = WorkerPool::new(
            Arc::new(Identity),
            0,
            &DeviceHint::Auto,
            &NoDevices,
            AggregatorConfig {
                batch_size: 1,
                batch_timeout: Duration::from_millis(5),
                timeout_semantics: aggregator::BatchTimeoutSemantics::FromLastPull,
                on_shape_mismatch: aggregator::OnShapeMismatch::PadError,
            },
            CooloffConfig::default(),
            16,
            Arc::new(PendingReplyTable::new()),
            Arc::new(StatisticCollector::new()),
        );
        assert!(matches!(err, Err(CreationError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn assigns_cpu_device_when_no_accelerators() {
        let pool = pool(3);
        for desc in pool.descriptors() {
            assert_eq!(desc.device, crate::common::CPU_DEVICE);
        }
        assert!(pool.is_ready());
        assert_eq!(pool.num_workers(), 3);
    }

    #[tokio::test]
    async fn submitted_request_gets_a_reply() {
        let reply_table = Arc::new(PendingReplyTable::new());
        let pool = WorkerPool::new(
            Arc::new(Identity),
            1,
            &DeviceHint::Auto,
            &NoDevices,
            AggregatorConfig {
                batch_size: 1,
                batch_timeout: Duration::from_millis(5),
                timeout_semantics: aggregator::BatchTimeoutSemantics::FromLastPull,
                on_shape_mismatch: aggregator::OnShapeMismatch::PadError,
            },
            CooloffConfig::default(),
            16,
            reply_table.clone(),
            Arc::new(StatisticCollector::new()),
        )
        .unwrap();

        let req = QueuedRequest {
            req_id: crate::common::ReqId(1),
            client_id: crate::common::ClientId(Bytes::from_static(b"c")),
            payload: Bytes::from_static(b"hi"),
            created_at: std::time::Instant::now(),
        };
        pool.submit(req).await.unwrap();

        let reply = reply_table.take(crate::common::ReqId(1), Duration::from_millis(100)).await.unwrap();
        assert_eq!(reply.unwrap(), b"hi".to_vec());
    }

    #[tokio::test]
    async fn is_ready_requires_every_worker_to_be_healthy_not_just_one() {
        let pool = pool(3);
        assert!(pool.is_ready());

        // Force one worker into cool-off directly; the other two stay
        // healthy. The pool as a whole must report not-ready.
        pool.workers[1].health.lock().increment_error();
        assert!(pool.is_ready(), "cooloff disabled by default, increment_error should be a no-op");

        let cooling = WorkerPool::new(
            Arc::new(Identity),
            2,
            &DeviceHint::Auto,
            &NoDevices,
            AggregatorConfig {
                batch_size: 4,
                batch_timeout: Duration::from_millis(5),
                timeout_semantics: aggregator::BatchTimeoutSemantics::FromLastPull,
                on_shape_mismatch: aggregator::OnShapeMismatch::PadError,
            },
            CooloffConfig { enabled: true, period: Duration::from_secs(60), error_limit: 1 },
            16,
            Arc::new(PendingReplyTable::new()),
            Arc::new(StatisticCollector::new()),
        )
        .unwrap();
        assert!(cooling.is_ready());

        cooling.workers[0].health.lock().increment_error();
        assert!(!cooling.is_ready(), "one worker in cooloff must hold the whole pool not-ready");
    }
}
