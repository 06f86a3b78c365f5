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
//! A batching-scheduler serving framework: accepts requests over a
//! length-prefixed frame protocol, coalesces them into batches sized for
//! an accelerator-bound compute function, and routes replies back to
//! their originating connection. Supports both a single-process Local
//! Batching Server topology and a Decentralized Fan-out Router topology
//! that dispatches to a reconfigurable set of remote backends.

pub mod acceptor;
pub mod aggregator;
pub mod backend;
pub mod common;
pub mod compute;
pub mod config;
pub mod dfr;
pub mod errors;
pub mod frame;
pub mod orchestrator;
pub mod reply_table;
pub mod sink;
pub mod stats;
pub mod telemetry;

pub use compute::Compute;
pub use errors::{ConfigError, ControlError, CreationError, DecodeError, PredictError, ReplyTableError};
