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
use std::io;

use crate::common::ReqId;

/// Raised while building a listener, worker pool, or DFR control plane out
/// of a parsed configuration. Always fatal at startup (spec.md 7).
#[derive(thiserror::Error, Debug)]
pub enum CreationError {
    #[error("invalid configuration parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid or missing resource: {0}")]
    InvalidResource(String),

    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] io::Error),

    #[error("every worker failed to start: {0}")]
    AllWorkersFailed(String),
}

/// Errors that can surface while decoding a wire frame (spec.md 4.1, 7).
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("expected 4 frames, got {0}")]
    WrongFrameCount(usize),

    #[error("frame exceeded maximum size ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("malformed meta JSON: {0}")]
    BadMeta(#[from] serde_json::Error),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("ndarray buffer length {buf_len} does not match shape {shape:?} and dtype {dtype}")]
    ShapeMismatch { buf_len: usize, shape: Vec<usize>, dtype: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors a `Compute` implementation can raise from `predict` (spec.md 7).
#[derive(thiserror::Error, Debug)]
pub enum PredictError {
    #[error("compute function failed: {0}")]
    Failed(String),

    #[error("predict returned {got} replies for a batch of {expected}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Errors surfaced by the pending-reply table (spec.md 4.2).
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReplyTableError {
    #[error("a reply for {0} was already pending")]
    DuplicateReply(ReqId),

    #[error("timed out waiting for a reply to {0}")]
    Timeout(ReqId),

    #[error("no pending entry for {0} (already taken or swept)")]
    NotFound(ReqId),
}

/// Errors surfaced by the DFR control plane state machine (spec.md 4.7).
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("malformed control frame: {0}")]
    Malformed(String),

    #[error("no backends configured")]
    NoBackends,
}

/// Top-level configuration errors, fatal at startup (spec.md 7).
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Creation(#[from] CreationError),

    #[error("environment variable SERVICE_ENV_SETTING must be one of DEVELOPMENT, STAGING, PRODUCTION, got {0:?}")]
    InvalidEnvSetting(Option<String>),

    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("gpu_memory_fraction must be within [0.0, 1.0], got {0}")]
    InvalidMemoryFraction(f32),
}
