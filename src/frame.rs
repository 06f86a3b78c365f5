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
//! The frame codec adapter (C1). Adapts the wire RPC transport -- four
//! length-prefixed frames per message -- into `Frame` values, the unit the
//! rest of the scheduler passes around. The compute function and the wire
//! codec are the two pieces spec.md explicitly treats as external
//! collaborators; this module is the seam between them and everything
//! else.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::DecodeError;

/// Per spec.md 6: clientId <= 255B, reqId <= 64B, meta <= 4KB. Payload is
/// otherwise unbounded but we still cap it generously to keep a single bad
/// length prefix from claiming gigabytes of buffer.
const MAX_CLIENT_ID_LEN: u32 = 255;
const MAX_REQ_ID_LEN: u32 = 64;
const MAX_META_LEN: u32 = 4 * 1024;
const MAX_PAYLOAD_LEN: u32 = 512 * 1024 * 1024;

/// Reserved command tokens used as frame 2 for control (spec.md 6).
pub mod control {
    pub const TERMINATION: &[u8] = b"TERMINATION";
    pub const IDLE: &[u8] = b"IDLE";
    pub const RESTART_CLIENT: &[u8] = b"RESTART_CLIENT";
    pub const SHOW_CONFIG: &[u8] = b"SHOW_CONFIG";
    pub const SWITCH: &[u8] = b"SWITCH";
}

/// Metadata describing how `payload` is encoded (spec.md 4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Meta {
    Object { protocol: i32, compress: u8 },
    Ndarray { dtype: String, shape: Vec<usize> },
}

/// A single four-frame message: `[clientId, reqId, payload, meta]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub client_id: Bytes,
    pub req_id: Bytes,
    pub payload: Bytes,
    pub meta: Bytes,
}

impl Frame {
    pub fn is_control(&self, token: &[u8]) -> bool { self.payload.as_ref() == token }

    pub fn decode_meta(&self) -> Result<Meta, DecodeError> { Ok(serde_json::from_slice(&self.meta)?) }
}

/// Reconstructs a raw ndarray buffer as a typed, shape-checked view.
///
/// Decoding is a thin validation layer over the raw bytes -- spec.md 4.1
/// calls for "no copy if the language permits a zero-copy view", which for
/// us means handing back the `Bytes` slice as-is once the length check
/// passes; interpreting it as a concrete numeric type is left to the
/// `Compute` implementation, which knows what dtype it expects.
pub fn validate_ndarray(buf: &Bytes, dtype: &str, shape: &[usize]) -> Result<(), DecodeError> {
    let elem_size = dtype_size(dtype).ok_or_else(|| DecodeError::UnsupportedDtype(dtype.to_owned()))?;
    let expected: usize = shape.iter().product::<usize>() * elem_size;
    if expected != buf.len() {
        return Err(DecodeError::ShapeMismatch {
            buf_len: buf.len(),
            shape: shape.to_vec(),
            dtype: dtype.to_owned(),
        });
    }
    Ok(())
}

fn dtype_size(dtype: &str) -> Option<usize> {
    match dtype {
        "int8" | "uint8" | "bool" => Some(1),
        "int16" | "uint16" | "float16" => Some(2),
        "int32" | "uint32" | "float32" => Some(4),
        "int64" | "uint64" | "float64" => Some(8),
        _ => None,
    }
}

/// Tokio-util codec for the four-frame wire protocol: each frame is a
/// `u32`-BE length prefix followed by that many bytes, four frames per
/// message, matching the length-prefixed layout in spec.md 6.
#[derive(Debug, Default)]
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Debug)]
enum DecodeState {
    ClientId,
    ReqId { client_id: Bytes },
    Payload { client_id: Bytes, req_id: Bytes },
    Meta { client_id: Bytes, req_id: Bytes, payload: Bytes },
}

impl Default for DecodeState {
    fn default() -> Self { DecodeState::ClientId }
}

fn try_read_len_prefixed(src: &mut BytesMut, max_len: u32) -> Result<Option<Bytes>, DecodeError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if len > max_len {
        return Err(DecodeError::FrameTooLarge(len as usize));
    }
    let total = 4 + len as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(4);
    Ok(Some(src.split_to(len as usize).freeze()))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            self.state = match std::mem::take(&mut self.state) {
                DecodeState::ClientId => match try_read_len_prefixed(src, MAX_CLIENT_ID_LEN)? {
                    Some(client_id) => DecodeState::ReqId { client_id },
                    None => {
                        self.state = DecodeState::ClientId;
                        return Ok(None);
                    },
                },
                DecodeState::ReqId { client_id } => match try_read_len_prefixed(src, MAX_REQ_ID_LEN)? {
                    Some(req_id) => DecodeState::Payload { client_id, req_id },
                    None => {
                        self.state = DecodeState::ReqId { client_id };
                        return Ok(None);
                    },
                },
                DecodeState::Payload { client_id, req_id } => match try_read_len_prefixed(src, MAX_PAYLOAD_LEN)? {
                    Some(payload) => DecodeState::Meta { client_id, req_id, payload },
                    None => {
                        self.state = DecodeState::Payload { client_id, req_id };
                        return Ok(None);
                    },
                },
                DecodeState::Meta { client_id, req_id, payload } => match try_read_len_prefixed(src, MAX_META_LEN)? {
                    Some(meta) => {
                        self.state = DecodeState::ClientId;
                        return Ok(Some(Frame { client_id, req_id, payload, meta }));
                    },
                    None => {
                        self.state = DecodeState::Meta { client_id, req_id, payload };
                        return Ok(None);
                    },
                },
            };
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DecodeError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), DecodeError> {
        for field in [&item.client_id, &item.req_id, &item.payload, &item.meta] {
            dst.put_u32(field.len() as u32);
            dst.put_slice(field);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn round_trips_a_frame() {
        let frame = Frame {
            client_id: Bytes::from_static(b"client-1"),
            req_id: Bytes::from_static(b"42"),
            payload: Bytes::from_static(b"hello"),
            meta: Bytes::from_static(b"{\"protocol\":-1,\"compress\":0}"),
        };

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("full frame available");
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_incrementally_across_partial_reads() {
        let frame = Frame {
            client_id: Bytes::from_static(b"c"),
            req_id: Bytes::from_static(b"1"),
            payload: Bytes::from_static(b"payload-bytes"),
            meta: Bytes::from_static(b"{}"),
        };

        let mut codec = FrameCodec::default();
        let mut full = BytesMut::new();
        codec.encode(frame.clone(), &mut full).unwrap();

        let mut fed = BytesMut::new();
        let mut result = None;
        for byte in full {
            fed.put_u8(byte);
            result = codec.decode(&mut fed).unwrap();
            if result.is_some() {
                break;
            }
        }
        assert_eq!(result, Some(frame));
    }

    #[test]
    fn rejects_oversized_client_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_CLIENT_ID_LEN + 1);
        let mut codec = FrameCodec::default();
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::FrameTooLarge(_))));
    }

    #[test]
    fn validates_ndarray_shape_against_buffer_length() {
        let buf = Bytes::from(vec![0u8; 24]);
        assert!(validate_ndarray(&buf, "float64", &[3]).is_ok());
        assert!(validate_ndarray(&buf, "float32", &[3]).is_err());
    }
}
