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
//! The DFR control-plane command set and reconfigurable backend list.
//! Generalizes `protocol.py`'s `ServerCmd` constants and
//! `decentralizedworker.py`'s `switch_server`/`show_config` payloads.

use serde::{Deserialize, Serialize};

use crate::errors::ControlError;
use crate::frame::Frame;
use crate::stats::StatSnapshot;

/// One remote backend a DFR fan-out can dispatch to: address plus the
/// control-reply port, mirroring the original's `(host, port, port_out)`
/// tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
    pub port_out: u16,
}

/// Live, swappable DFR configuration: which backends to fan out to and
/// how many client tasks to run per backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfrConfig {
    pub backends: Vec<BackendAddr>,
    pub clients_per_backend: usize,
}

/// Parsed control command, decoded off the same `FrameCodec` wire used
/// for data requests (SPEC_FULL.md 3, C8). Reuses the `control` frame
/// tokens already defined for the LBS path (spec.md 6).
#[derive(Debug, Clone, PartialEq)]
pub enum DfrCommand {
    Terminate,
    Idle,
    RestartClients,
    ShowConfig,
    Switch(SwitchRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub backends: Vec<BackendAddr>,
    pub clients_per_backend: usize,
}

/// Reply to a `SHOW_CONFIG` control command, merging the backend list
/// with live statistics, matching `decentralizedworker.py`'s
/// `show_config`/`_run`'s `ServerCmd.show_config` branch plus
/// SPEC_FULL.md 2's field additions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowConfigReply {
    pub port: u16,
    pub port_out: u16,
    pub num_workers: usize,
    pub clients_per_backend: usize,
    pub backends: Vec<BackendAddr>,
    pub stats: StatSnapshot,
    pub server_version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchReply {
    pub success: bool,
}

/// Decodes a `DfrCommand` out of the control frame's `payload`/`meta`
/// fields, using the same reserved tokens the LBS path uses for its
/// control frames.
pub fn parse_command(frame: &Frame) -> Result<DfrCommand, ControlError> {
    use crate::frame::control;

    if frame.is_control(control::TERMINATION) {
        return Ok(DfrCommand::Terminate);
    }
    if frame.is_control(control::IDLE) {
        return Ok(DfrCommand::Idle);
    }
    if frame.is_control(control::RESTART_CLIENT) {
        return Ok(DfrCommand::RestartClients);
    }
    if frame.is_control(control::SHOW_CONFIG) {
        return Ok(DfrCommand::ShowConfig);
    }
    if frame.is_control(control::SWITCH) {
        let req: SwitchRequest =
            serde_json::from_slice(&frame.meta).map_err(|e| ControlError::Malformed(e.to_string()))?;
        return Ok(DfrCommand::Switch(req));
    }

    Err(ControlError::Malformed(format!("unrecognized control token ({} bytes)", frame.payload.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::frame::control;

    fn control_frame(token: &'static [u8], meta: &str) -> Frame {
        Frame {
            client_id: Bytes::from_static(b"dfr"),
            req_id: Bytes::from_static(b"0"),
            payload: Bytes::from_static(token),
            meta: Bytes::copy_from_slice(meta.as_bytes()),
        }
    }

    #[test]
    fn parses_every_reserved_token() {
        assert_eq!(parse_command(&control_frame(control::TERMINATION, "")).unwrap(), DfrCommand::Terminate);
        assert_eq!(parse_command(&control_frame(control::IDLE, "")).unwrap(), DfrCommand::Idle);
        assert_eq!(parse_command(&control_frame(control::RESTART_CLIENT, "")).unwrap(), DfrCommand::RestartClients);
        assert_eq!(parse_command(&control_frame(control::SHOW_CONFIG, "")).unwrap(), DfrCommand::ShowConfig);
    }

    #[test]
    fn parses_switch_with_backend_list() {
        let meta = r#"{"backends":[{"host":"10.0.0.1","port":5000,"port_out":5001}],"clients_per_backend":2}"#;
        let cmd = parse_command(&control_frame(control::SWITCH, meta)).unwrap();
        match cmd {
            DfrCommand::Switch(req) => {
                assert_eq!(req.clients_per_backend, 2);
                assert_eq!(req.backends.len(), 1);
            },
            other => panic!("expected Switch, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unrecognized_token() {
        let frame = control_frame(b"BOGUS", "");
        assert!(parse_command(&frame).is_err());
    }
}
