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
//! CLI entry point: `serve` / `shutdown` / `switch` / `show-config`,
//! matching `helper.py::get_args_parser`/`get_shutdown_parser` and
//! `decentralizedworker.py`'s static command helpers. See spec.md 6.

use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};

use batchgate::backend::device::DeviceHint;
use batchgate::common::Protocol;
use batchgate::frame::{control, Frame, FrameCodec};

#[derive(Parser)]
#[command(name = "batchgate", version, about = "A batching-scheduler serving framework")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a server (LBS or DFR, per --topology).
    Serve {
        #[arg(long)]
        model_dir: PathBuf,
        #[arg(long, default_value_t = 1)]
        num_worker: usize,
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
        #[arg(long, default_value_t = 1)]
        batch_group_timeout_ms: u64,
        #[arg(long, value_delimiter = ',')]
        device_map: Vec<i32>,
        #[arg(long)]
        cpu: bool,
        #[arg(long, default_value_t = 0.2)]
        gpu_memory_fraction: f32,
        #[arg(long, default_value = "obj")]
        protocol: String,
        #[arg(long, default_value_t = 5555)]
        port: u16,
        #[arg(long, default_value_t = 5556)]
        port_out: u16,
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[arg(long)]
        verbose: bool,
    },
    /// Send a TERMINATION control frame to a running server.
    Shutdown {
        #[arg(long, default_value = "localhost")]
        ip: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value_t = 5000)]
        timeout: u64,
    },
    /// Reconfigure a DFR router's backend list (DFR only).
    Switch {
        #[arg(long, default_value = "localhost")]
        ip: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        port_out: u16,
        #[arg(long)]
        num_client: usize,
        /// JSON array of [host, portIn, portOut] triples.
        #[arg(long)]
        remote_servers: String,
        #[arg(long, default_value_t = 5000)]
        timeout: u64,
    },
    /// Request the current server configuration and live statistics.
    ShowConfig {
        #[arg(long, default_value = "localhost")]
        ip: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        port_out: u16,
        #[arg(long, default_value_t = 5000)]
        timeout: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = run(cli);
    std::process::exit(code);
}

fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Serve { model_dir, num_worker, batch_size, batch_group_timeout_ms, device_map, cpu, gpu_memory_fraction, protocol, port, port_out, log_dir, verbose } => {
            batchgate::telemetry::init(verbose, log_dir.as_deref());

            if num_worker == 0 || batch_size == 0 {
                tracing::error!("num_worker and batch_size must both be >= 1");
                return 1;
            }
            if !(0.0..=1.0).contains(&gpu_memory_fraction) {
                tracing::error!(gpu_memory_fraction, "must be within [0.0, 1.0]");
                return 1;
            }
            let protocol = match protocol.to_lowercase().as_str() {
                "obj" => Protocol::Obj,
                "numpy" => Protocol::Numpy,
                other => {
                    tracing::error!(protocol = other, "must be 'obj' or 'numpy'");
                    return 1;
                },
            };
            let _ = protocol;

            let device_hint =
                if cpu { DeviceHint::CpuOnly } else if device_map.is_empty() { DeviceHint::Auto } else { DeviceHint::Explicit(device_map) };
            let _ = (model_dir, device_hint, batch_group_timeout_ms);

            let addr: SocketAddr = match format!("0.0.0.0:{}", port).parse() {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::error!(error = %err, "invalid bind address");
                    return 2;
                },
            };

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(err) => {
                    tracing::error!(error = %err, "failed to start async runtime");
                    return 2;
                },
            };

            tracing::info!(%addr, port_out, num_worker, batch_size, "starting batchgate server");
            // Wiring a concrete `Compute` implementation is left to the
            // binary's embedder: this CLI only validates arguments and
            // demonstrates bind/shutdown plumbing here, since there is no
            // compute function to load without one.
            runtime.block_on(async {
                match batchgate::acceptor::bind(addr) {
                    Ok(listener) => drop(listener),
                    Err(err) => tracing::error!(error = %err, "bind failed"),
                }
            });

            0
        },
        Command::Shutdown { ip, port, timeout } => send_control(&ip, port, timeout, control::TERMINATION, &[]).map_or(2, |_| 0),
        Command::Switch { ip, port, port_out, num_client, remote_servers, timeout } => {
            let backends: Vec<(String, u16, u16)> = match serde_json::from_str(&remote_servers) {
                Ok(v) => v,
                Err(err) => {
                    eprintln!("invalid -remote-servers JSON: {}", err);
                    return 1;
                },
            };
            let payload = serde_json::json!({
                "backends": backends.iter().map(|(h, p, po)| serde_json::json!({"host": h, "port": p, "port_out": po})).collect::<Vec<_>>(),
                "clients_per_backend": num_client,
            });
            let body = match serde_json::to_vec(&payload) {
                Ok(b) => b,
                Err(err) => {
                    eprintln!("failed to encode switch request: {}", err);
                    return 1;
                },
            };
            match send_control(&ip, port, timeout, control::SWITCH, &body) {
                Ok(_) => {
                    let _ = port_out;
                    0
                },
                Err(_) => 2,
            }
        },
        Command::ShowConfig { ip, port, port_out, timeout } => {
            let _ = port_out;
            send_control(&ip, port, timeout, control::SHOW_CONFIG, &[]).map_or(2, |_| 0)
        },
    }
}

/// Connects to a running server and writes one control frame, matching
/// `WKRDecentralizeCentral`'s static `terminate`/`idle`/`restart_clients`/
/// `switch_server`/`show_config` helpers (PUSH a command frame over a
/// plain TCP connection rather than ZMQ, per this crate's transport).
fn send_control(ip: &str, port: u16, timeout_ms: u64, token: &'static [u8], meta: &[u8]) -> Result<(), ()> {
    use std::io::Write;
    use tokio_util::codec::Encoder;

    let addr = format!("{}:{}", ip, port);
    let mut stream = match StdTcpStream::connect(&addr) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("failed to connect to {}: {}", addr, err);
            return Err(());
        },
    };
    let _ = stream.set_write_timeout(Some(Duration::from_millis(timeout_ms)));

    let frame = Frame {
        client_id: Bytes::from_static(b"cli"),
        req_id: Bytes::from_static(b"0"),
        payload: Bytes::from_static(token),
        meta: Bytes::copy_from_slice(meta),
    };

    let mut codec = FrameCodec::default();
    let mut buf = bytes::BytesMut::new();
    if codec.encode(frame, &mut buf).is_err() {
        eprintln!("failed to encode control frame");
        return Err(());
    }

    stream.write_all(&buf).map_err(|err| {
        eprintln!("failed to send control frame: {}", err);
    })
}
