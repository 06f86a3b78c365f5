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
//! End-to-end LBS scenarios over a real TCP socket: single-shot echo,
//! batch coalescing, and a predict failure surfacing as an error reply.
//! See spec.md 8, scenarios 1-2 and 4.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use batchgate::aggregator::{AggregatorConfig, BatchTimeoutSemantics, OnShapeMismatch};
use batchgate::backend::device::{DeviceHint, NoDevices};
use batchgate::backend::pool::{CooloffConfig, WorkerPool};
use batchgate::compute::Compute;
use batchgate::errors::PredictError;
use batchgate::frame::{Frame, FrameCodec};
use batchgate::orchestrator::{Orchestrator, ShutdownConfig};
use batchgate::reply_table::PendingReplyTable;
use batchgate::sink::SinkConfig;
use batchgate::stats::StatisticCollector;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

struct Uppercase;

impl Compute for Uppercase {
    type Item = Vec<u8>;

    fn preprocess(&self, raw: &[u8]) -> Result<Self::Item, PredictError> {
        if raw == b"boom" {
            return Err(PredictError::Failed("simulated failure".to_string()));
        }
        Ok(raw.to_ascii_uppercase())
    }

    fn predict(&self, batch: Vec<Self::Item>) -> Result<Vec<Self::Item>, PredictError> { Ok(batch) }

    fn postprocess(&self, item: Self::Item) -> Vec<u8> { item }
}

async fn start_server(addr: SocketAddr, batch_size: usize) -> tokio::task::JoinHandle<()> {
    let reply_table = Arc::new(PendingReplyTable::new());
    let stats = Arc::new(StatisticCollector::new());
    let pool = Arc::new(
        WorkerPool::new(
            Arc::new(Uppercase),
            2,
            &DeviceHint::Auto,
            &NoDevices,
            AggregatorConfig {
                batch_size,
                batch_timeout: Duration::from_millis(30),
                timeout_semantics: BatchTimeoutSemantics::FromLastPull,
                on_shape_mismatch: OnShapeMismatch::PadError,
            },
            CooloffConfig::default(),
            64,
            reply_table.clone(),
            stats.clone(),
        )
        .unwrap(),
    );

    let orchestrator = Orchestrator::new(pool, reply_table, stats, ShutdownConfig { drain_timeout: Duration::from_secs(1) });
    let sink_config = SinkConfig { client_deadline: Duration::from_secs(2) };

    tokio::spawn(async move {
        orchestrator.serve(addr, sink_config, None).await.unwrap();
    })
}

fn make_frame(client: &str, req: &str, payload: &str) -> Frame {
    Frame {
        client_id: Bytes::copy_from_slice(client.as_bytes()),
        req_id: Bytes::copy_from_slice(req.as_bytes()),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
        meta: Bytes::from_static(b"{\"protocol\":-1,\"compress\":0}"),
    }
}

#[tokio::test]
async fn single_shot_request_echoes_uppercased_payload() {
    let addr: SocketAddr = "127.0.0.1:18551".parse().unwrap();
    let _server = start_server(addr, 8).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());

    framed.send(make_frame("client-a", "1", "hello")).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.payload.as_ref(), b"HELLO");
}

#[tokio::test]
async fn concurrent_requests_from_one_client_all_get_replies() {
    let addr: SocketAddr = "127.0.0.1:18552".parse().unwrap();
    let _server = start_server(addr, 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());

    for i in 0..4 {
        framed.send(make_frame("client-b", &i.to_string(), "ping")).await.unwrap();
    }

    let mut seen = 0;
    while seen < 4 {
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(reply.payload.as_ref(), b"PING");
        seen += 1;
    }
}

#[tokio::test]
async fn predict_failure_surfaces_as_error_reply_not_a_dropped_connection() {
    let addr: SocketAddr = "127.0.0.1:18553".parse().unwrap();
    let _server = start_server(addr, 8).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());

    framed.send(make_frame("client-c", "1", "boom")).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&reply.payload).contains("simulated failure"));

    // the connection is still alive for a follow-up request
    framed.send(make_frame("client-c", "2", "ok")).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.payload.as_ref(), b"OK");
}
