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
use std::{
    fmt,
    process,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use bytes::Bytes;

/// Opaque bytes identifying the sender of a request.
///
/// Typically a UUID handed out by the client, but the scheduler never
/// inspects the contents -- it's just a correlation key for statistics and
/// for routing replies back to the right socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub Bytes);

impl ClientId {
    pub fn as_bytes(&self) -> &[u8] { &self.0 }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// A unique request identifier.
///
/// Generated by a connection sink on frame receipt: a monotonic
/// nanosecond-ish counter folded with a process id suffix in the low 16
/// bits, per spec.md 4.5. The counter is strictly increasing even when two
/// requests land in the same nanosecond, so `ReqId` ordering also reflects
/// arrival order within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub u64);

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:x}", self.0) }
}

/// Generates process-unique `ReqId`s.
///
/// Shared across every connection sink in the process; a single atomic
/// counter is what makes ids unique across sinks without coordination.
pub struct ReqIdGenerator {
    epoch: Instant,
    last: AtomicU64,
    pid_suffix: u64,
}

impl ReqIdGenerator {
    pub fn new() -> Self {
        ReqIdGenerator {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
            pid_suffix: u64::from(process::id()) & 0xFFFF,
        }
    }

    /// Produces the next `ReqId`, guaranteed to be unique and
    /// non-decreasing relative to every prior call on this generator.
    pub fn next(&self) -> ReqId {
        let nanos = self.epoch.elapsed().as_nanos() as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = nanos.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return ReqId((candidate << 16) | self.pid_suffix),
                Err(cur) => last = cur,
            }
        }
    }
}

impl Default for ReqIdGenerator {
    fn default() -> Self { Self::new() }
}

/// Wire payload encoding, chosen per-deployment (spec.md 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Obj,
    Numpy,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Obj => write!(f, "obj"),
            Protocol::Numpy => write!(f, "numpy"),
        }
    }
}

/// A device id assignment for a worker: `-1` denotes CPU, non-negative
/// denotes a concrete accelerator index.
pub type DeviceId = i32;
pub const CPU_DEVICE: DeviceId = -1;

/// One item pulled off the inference queue: the request that produced it,
/// plus the raw payload bytes to feed into preprocessing.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub req_id: ReqId,
    pub client_id: ClientId,
    pub payload: Bytes,
    pub created_at: Instant,
}

/// An ordered batch of requests, bounded in `[1, batch_size]` (spec.md 3).
pub type Batch = Vec<QueuedRequest>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_ids_are_unique_and_non_decreasing() {
        let gen = ReqIdGenerator::new();
        let mut prev = gen.next();
        for _ in 0..1000 {
            let next = gen.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn req_ids_share_a_pid_suffix_within_one_process() {
        let a = ReqIdGenerator::new();
        let b = ReqIdGenerator::new();
        // Two generators in the same process carry the same pid suffix --
        // the monotonic high bits are what keep ids from concurrent sinks
        // apart, not the suffix (spec.md 4.5).
        assert_eq!(a.next().0 & 0xFFFF, b.next().0 & 0xFFFF);
    }

    #[test]
    fn client_id_displays_utf8_when_possible() {
        let id = ClientId(Bytes::from_static(b"client-42"));
        assert_eq!(id.to_string(), "client-42");
    }
}
