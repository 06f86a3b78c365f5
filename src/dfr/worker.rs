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
//! One DFR client task (generalizes `decentralizedworker.py`'s
//! `WKRWorker`): connects to a remote backend and repeatedly calls
//! `do_work` until cancelled.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dfr::control::BackendAddr;

/// Minimum pause between `do_work` iterations (spec.md 4.7: "sleeping
/// >= 10 ms between iterations"), so a worker whose backend call returns
/// instantly doesn't spin the task scheduler.
const MIN_ITERATION_PAUSE: Duration = Duration::from_millis(10);

/// A unit of remote work a DFR client repeats in a loop. `model` is
/// loaded once via `connect` and reused across every `do_work` call,
/// mirroring `WKRWorker.get_model`/`do_work`/`off_model`.
#[async_trait]
pub trait DfrWorker: Send + Sync + 'static {
    type Model: Send;

    async fn connect(&self, backend: &BackendAddr) -> Self::Model;

    /// Performs one unit of work against `model`. Errors are logged and
    /// swallowed -- per the original's `try/except` around `do_work`, one
    /// failed iteration doesn't kill the worker loop.
    async fn do_work(&self, model: &mut Self::Model) -> Result<(), String>;
}

/// Runs `worker.do_work` in a loop against `backend` until `shutdown`
/// fires, matching `WKRWorker.run`'s `while not exit_flag.is_set()` loop
/// (with a short pause between iterations instead of the original's fixed
/// `time.sleep(0.01)`, since we can `select!` on cancellation instead of
/// polling a flag).
pub async fn run<W: DfrWorker>(worker: W, backend: BackendAddr, shutdown: CancellationToken) {
    let mut model = worker.connect(&backend).await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(?backend, "dfr worker exiting");
                return;
            }
            result = worker.do_work(&mut model) => {
                if let Err(err) = result {
                    tracing::error!(?backend, error = %err, "dfr worker iteration failed");
                }
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(?backend, "dfr worker exiting");
                return;
            }
            _ = tokio::time::sleep(MIN_ITERATION_PAUSE) => {}
        }
    }
}
