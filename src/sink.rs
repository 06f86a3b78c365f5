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
//! The connection sink (C5): one task per accepted client, decoding
//! frames, dispatching requests into the worker pool, and correlating
//! replies back through the pending-reply table. See spec.md 4.5.
//!
//! Generalizes `listener.rs`'s per-client `Pipeline::new(...)` spawn and
//! `service/pipeline.rs`'s `Pipeline` future -- but `Pipeline` drives
//! requests through a `FuturesOrdered`, which assumes replies land in the
//! order requests were sent. Batching here deliberately reorders replies
//! (a request can land in a later, faster batch than one sent just before
//! it), so this loop is new code built directly on `Framed<TcpStream,
//! FrameCodec>` rather than reusing `Pipeline`.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::aggregator::Reply;
use crate::common::{ClientId, QueuedRequest, ReqIdGenerator};
use crate::backend::pool::WorkerPool;
use crate::frame::{control, Frame, FrameCodec};
use crate::reply_table::PendingReplyTable;
use crate::stats::StatisticCollector;

/// Per-connection tuning shared across every sink task.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub client_deadline: Duration,
}

/// Drives one accepted TCP connection until it closes or a `TERMINATION`
/// control frame is received. Every request is dispatched to the pool and
/// raced independently against `client_deadline` -- a slow request never
/// blocks its connection-mates from being read and dispatched.
pub async fn run(
    stream: TcpStream, pool: Arc<WorkerPool>, reply_table: Arc<PendingReplyTable<Reply>>,
    req_ids: Arc<ReqIdGenerator>, stats: Arc<StatisticCollector>, config: SinkConfig,
) {
    let mut framed = Framed::new(stream, FrameCodec::default());

    loop {
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "sink decode error, closing connection");
                return;
            },
            None => return,
        };

        if frame.is_control(control::TERMINATION) {
            tracing::debug!("client sent TERMINATION, closing connection");
            return;
        }

        let client_id = ClientId(frame.client_id.clone());
        let is_control = frame.is_control(control::IDLE)
            || frame.is_control(control::RESTART_CLIENT)
            || frame.is_control(control::SHOW_CONFIG)
            || frame.is_control(control::SWITCH);
        stats.record_request(&client_id, is_control);

        let req_id = req_ids.next();
        let queued = QueuedRequest {
            req_id,
            client_id: client_id.clone(),
            payload: frame.payload.clone(),
            created_at: std::time::Instant::now(),
        };

        if pool.submit(queued).await.is_err() {
            tracing::error!(%req_id, "worker pool unavailable, dropping request");
            return;
        }

        let reply = reply_table.take(req_id, config.client_deadline).await;

        let out = match reply {
            Ok(Ok(payload)) => Frame { client_id: frame.client_id, req_id: frame.req_id, payload: payload.into(), meta: frame.meta },
            Ok(Err(predict_err)) => error_frame(&frame, &predict_err.to_string()),
            Err(table_err) => error_frame(&frame, &table_err.to_string()),
        };

        if let Err(err) = framed.send(out).await {
            tracing::warn!(error = %err, "sink encode/write error, closing connection");
            return;
        }
    }
}

fn error_frame(original: &Frame, message: &str) -> Frame {
    Frame {
        client_id: original.client_id.clone(),
        req_id: original.req_id.clone(),
        payload: bytes::Bytes::copy_from_slice(message.as_bytes()),
        meta: bytes::Bytes::from_static(b"{\"protocol\":-1,\"compress\":0}"),
    }
}
