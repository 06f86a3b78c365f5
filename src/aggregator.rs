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
//! The batch aggregator (C3): pulls queued requests for one worker, waits
//! for either `batch_size` items or an idle timeout, and hands the
//! resulting batch to a `Compute` implementation. See spec.md 4.3.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::backend::health::WorkerHealth;
use crate::common::{Batch, QueuedRequest, ReqId};
use crate::compute::{check_batch_shape, Compute};
use crate::errors::PredictError;
use crate::reply_table::PendingReplyTable;
use crate::stats::StatisticCollector;

/// Governs when the idle-timeout deadline resets while a batch is
/// accumulating (spec.md 4.3/9's open question on timeout semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTimeoutSemantics {
    /// Default: the deadline resets every time an item is pulled, so a
    /// steady trickle of requests can keep a batch open indefinitely
    /// until `batch_size` is hit.
    FromLastPull,
    /// The deadline is fixed the moment the batch opens (its first item
    /// arrives) and never resets.
    FromOpen,
}

/// How to handle `predict` returning a different number of items than it
/// was given a batch of (spec.md 4.3 step 3, 7 `ShapeMismatch`). The
/// answered prefix always keeps its real replies either way -- only the
/// unanswered tail's fate differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnShapeMismatch {
    /// Default: fail the tail's requests with a `ShapeMismatch` error so
    /// their clients get a prompt reply instead of waiting out the full
    /// reply deadline.
    PadError,
    /// Drop the tail silently -- those requests are left unanswered and
    /// eventually time out in the reply table.
    DropTail,
}

impl Default for OnShapeMismatch {
    fn default() -> Self { OnShapeMismatch::PadError }
}

/// Tuning knobs for one aggregator loop.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub timeout_semantics: BatchTimeoutSemantics,
    pub on_shape_mismatch: OnShapeMismatch,
}

/// Reply handed back to a connection sink once a batch item has been
/// predicted (or failed).
pub type Reply = Result<Vec<u8>, PredictError>;

/// Pulls from `inbox` and drives one worker's `Compute` instance,
/// generalizing `backend/backend.rs`'s `BackendConnection::poll`
/// drain-then-run loop and `worker_skeleton.py`'s `gen()` batch
/// accumulation loop into async/await. Runs until `inbox` is closed.
pub async fn run<C: Compute>(
    compute: Arc<C>, mut inbox: mpsc::Receiver<QueuedRequest>, reply_table: Arc<PendingReplyTable<Reply>>,
    stats: Arc<StatisticCollector>, health: Arc<parking_lot::Mutex<WorkerHealth>>, config: AggregatorConfig,
) {
    loop {
        let Some(batch) = collect_batch(&mut inbox, &config).await else {
            // Inbox closed with nothing left buffered: the pool is shutting
            // this worker down.
            return;
        };

        let oldest_age = batch.first().map(|r| r.created_at.elapsed()).unwrap_or_default();
        let batch_len = batch.len();
        let started = Instant::now();

        let outcome = run_batch(&compute, &batch);

        match &outcome {
            BatchOutcome::Ok(_) => {
                health.lock().is_healthy();
            },
            BatchOutcome::Failed(_) | BatchOutcome::ShapeMismatch { .. } => {
                health.lock().increment_error();
            },
        }

        stats.record_batch(batch_len, oldest_age, started.elapsed());

        dispatch_replies(&reply_table, batch, outcome, config.on_shape_mismatch);
    }
}

/// Drains up to `batch_size` items from `inbox`, applying the configured
/// idle-timeout semantics. Returns `None` once `inbox` is closed and
/// drained dry; returns `Some(batch)` with at least one item otherwise
/// (spec.md 4.3: a batch never closes empty).
async fn collect_batch(inbox: &mut mpsc::Receiver<QueuedRequest>, config: &AggregatorConfig) -> Option<Batch> {
    let first = inbox.recv().await?;
    let mut batch = vec![first];
    let opened_at = Instant::now();

    loop {
        if batch.len() >= config.batch_size {
            return Some(batch);
        }

        let deadline = match config.timeout_semantics {
            BatchTimeoutSemantics::FromLastPull => Instant::now() + config.batch_timeout,
            BatchTimeoutSemantics::FromOpen => opened_at + config.batch_timeout,
        };
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Some(batch);
        };

        match tokio::time::timeout(remaining, inbox.recv()).await {
            Ok(Some(item)) => batch.push(item),
            Ok(None) => return Some(batch),
            Err(_elapsed) => return Some(batch),
        }
    }
}

/// Outcome of running one batch through a `Compute`. A shape mismatch is
/// kept distinct from an outright failure: it still carries whatever
/// outputs `predict` did produce, so the answered prefix's real replies
/// survive (spec.md 4.3 step 3).
enum BatchOutcome {
    Ok(Vec<Vec<u8>>),
    ShapeMismatch { outputs: Vec<Vec<u8>>, expected: usize, got: usize },
    Failed(PredictError),
}

fn run_batch<C: Compute>(compute: &C, batch: &Batch) -> BatchOutcome {
    let mut items = Vec::with_capacity(batch.len());
    for req in batch {
        match compute.preprocess(&req.payload) {
            Ok(item) => items.push(item),
            Err(err) => return BatchOutcome::Failed(err),
        }
    }

    let predicted = match compute.predict(items) {
        Ok(predicted) => predicted,
        Err(err) => return BatchOutcome::Failed(err),
    };

    let expected = batch.len();
    let got = predicted.len();
    let outputs: Vec<Vec<u8>> = predicted.into_iter().map(|item| compute.postprocess(item)).collect();

    if check_batch_shape(expected, &outputs).is_ok() {
        BatchOutcome::Ok(outputs)
    } else {
        BatchOutcome::ShapeMismatch { outputs, expected, got }
    }
}

fn dispatch_replies(
    reply_table: &PendingReplyTable<Reply>, batch: Batch, outcome: BatchOutcome, on_shape_mismatch: OnShapeMismatch,
) {
    match outcome {
        BatchOutcome::Ok(outputs) => {
            for (req, output) in batch.into_iter().zip(outputs) {
                put_reply(reply_table, req.req_id, Ok(output));
            }
        },
        BatchOutcome::Failed(err) => {
            // A whole-batch failure (preprocess or predict itself errored)
            // fails every member identically -- there's no way to
            // attribute blame to one request in the batch.
            for req in batch {
                put_reply(reply_table, req.req_id, Err(clone_predict_error(&err)));
            }
        },
        BatchOutcome::ShapeMismatch { outputs, expected, got } => {
            tracing::warn!(expected, got, "predict returned a different item count than requested");

            // `worker_skeleton.py:128-132`: log, then `zip(client_ids,
            // outputs)` -- the answered prefix gets its real reply, only
            // the unanswered tail is affected by policy.
            let mut requests = batch.into_iter();
            for (req, output) in (&mut requests).zip(outputs) {
                put_reply(reply_table, req.req_id, Ok(output));
            }

            match on_shape_mismatch {
                OnShapeMismatch::PadError => {
                    for req in requests {
                        put_reply(reply_table, req.req_id, Err(PredictError::ShapeMismatch { expected, got }));
                    }
                },
                OnShapeMismatch::DropTail => {
                    for req in requests {
                        tracing::warn!(
                            req_id = %req.req_id,
                            "dropping unanswered tail request after shape mismatch"
                        );
                    }
                },
            }
        },
    }
}

fn clone_predict_error(err: &PredictError) -> PredictError {
    match err {
        PredictError::Failed(msg) => PredictError::Failed(msg.clone()),
        PredictError::ShapeMismatch { expected, got } => PredictError::ShapeMismatch { expected: *expected, got: *got },
    }
}

fn put_reply(reply_table: &PendingReplyTable<Reply>, req_id: ReqId, reply: Reply) {
    if let Err(err) = reply_table.put(req_id, reply) {
        tracing::warn!(%req_id, error = %err, "failed to deliver reply, client likely gone");
    }
}
