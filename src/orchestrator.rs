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
//! The Local Batching Server orchestrator (C7): wires the acceptor,
//! worker pool, sink tasks, and reply-table sweeper into one runtime,
//! and drives cooperative shutdown across all of them. Generalizes
//! `listener.rs::from_config`. See spec.md 4.7 (LBS variant) and 5.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::acceptor;
use crate::aggregator::Reply;
use crate::backend::pool::WorkerPool;
use crate::common::ReqIdGenerator;
use crate::errors::CreationError;
use crate::reply_table::{self, PendingReplyTable};
use crate::sink::{self, SinkConfig};
use crate::stats::StatisticCollector;

/// Upper bound on concurrently-served connections, used to size the
/// semaphore that also doubles as the orchestrator's drain counter.
const MAX_CONNECTIONS: usize = 65536;

/// How long the orchestrator waits for in-flight connections to drain on
/// shutdown before it gives up and lets them be dropped (spec.md 5's
/// drain/force-kill timeout policy).
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub drain_timeout: Duration,
}

pub struct Orchestrator {
    pub pool: Arc<WorkerPool>,
    pub reply_table: Arc<PendingReplyTable<Reply>>,
    pub stats: Arc<StatisticCollector>,
    shutdown: CancellationToken,
    connections: Arc<Semaphore>,
    shutdown_cfg: ShutdownConfig,
}

impl Orchestrator {
    pub fn new(pool: Arc<WorkerPool>, reply_table: Arc<PendingReplyTable<Reply>>, stats: Arc<StatisticCollector>, shutdown_cfg: ShutdownConfig) -> Self {
        Orchestrator {
            pool,
            reply_table,
            stats,
            shutdown: CancellationToken::new(),
            connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown_cfg,
        }
    }

    pub fn shutdown_handle(&self) -> CancellationToken { self.shutdown.clone() }

    /// Runs the full LBS lifecycle: binds `addr`, accepts connections,
    /// spawns a sink task per connection (mirroring `build_router_chain`'s
    /// per-client `Pipeline` spawn), and sweeps the reply table on an
    /// interval. Returns once shutdown has drained (or timed out).
    pub async fn serve(
        &self, addr: SocketAddr, sink_config: SinkConfig, reply_ttl: Option<Duration>,
    ) -> Result<(), CreationError> {
        let listener = acceptor::bind(addr)?;
        tracing::info!(%addr, "orchestrator listening");

        let (conn_tx, mut conn_rx) = mpsc::channel::<TcpStream>(128);
        let acceptor_shutdown = self.shutdown.clone();
        let acceptor_task = tokio::spawn(acceptor::run(listener, conn_tx, acceptor_shutdown));

        let (sweep_tx, sweep_rx) = watch::channel(false);
        let sweeper_table = self.reply_table.clone();
        let sweeper_task = tokio::spawn(reply_table::run_sweeper(sweeper_table, reply_ttl, sweep_rx));

        let req_ids = Arc::new(ReqIdGenerator::new());

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                maybe_stream = conn_rx.recv() => {
                    match maybe_stream {
                        Some(stream) => self.spawn_sink(stream, sink_config.clone(), req_ids.clone()),
                        None => break,
                    }
                }
            }
        }

        self.drain().await;
        let _ = sweep_tx.send(true);
        let _ = acceptor_task.await;
        let _ = sweeper_task.await;
        Ok(())
    }

    fn spawn_sink(&self, stream: TcpStream, config: SinkConfig, req_ids: Arc<ReqIdGenerator>) {
        let pool = self.pool.clone();
        let reply_table = self.reply_table.clone();
        let stats = self.stats.clone();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            let Ok(permit) = connections.acquire_owned().await else { return };
            sink::run(stream, pool, reply_table, req_ids, stats, config).await;
            drop(permit);
        });
    }

    /// Waits for every outstanding sink task to finish, up to
    /// `drain_timeout`. `Semaphore` doubles as a live connection counter:
    /// acquiring every permit back means every sink has returned its
    /// permit (i.e. exited).
    async fn drain(&self) {
        let acquire_all = self.connections.clone().acquire_many_owned(MAX_CONNECTIONS as u32);
        match tokio::time::timeout(self.shutdown_cfg.drain_timeout, acquire_all).await {
            Ok(Ok(_permit)) => tracing::info!("all connections drained"),
            _ => tracing::warn!("drain timeout elapsed, remaining connections will be dropped"),
        }
    }

    pub fn request_shutdown(&self) { self.shutdown.cancel(); }
}
