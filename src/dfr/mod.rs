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
//! The Decentralized Fan-out Router control plane (C8): owns the set of
//! remote backends a fleet of client tasks dispatches to, and a command
//! loop that can idle, restart, switch, or report on that fleet at
//! runtime. Generalizes `decentralizedworker.py`'s
//! `WKRDecentralizeCentral`. See spec.md 4.7 (DFR variant) and 6.

pub mod control;
pub mod worker;

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::dfr::control::{BackendAddr, DfrCommand, DfrConfig, ShowConfigReply, SwitchReply};
use crate::dfr::worker::DfrWorker;
use crate::errors::ControlError;
use crate::frame::FrameCodec;
use crate::stats::StatisticCollector;

/// One running client task plus the means to stop it.
struct ClientHandle {
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Runtime state of the DFR control plane: the live configuration (read
/// by `show-config` without locking, via `ArcSwap`) and the currently
/// spawned client fleet.
pub struct DfrControlPlane<W: DfrWorker + Clone> {
    config: ArcSwap<DfrConfig>,
    clients: Vec<ClientHandle>,
    worker: W,
    port: u16,
    port_out: u16,
    stats: Arc<StatisticCollector>,
}

impl<W: DfrWorker + Clone> DfrControlPlane<W> {
    pub fn new(worker: W, initial: DfrConfig, port: u16, port_out: u16, stats: Arc<StatisticCollector>) -> Self {
        DfrControlPlane { config: ArcSwap::from_pointee(initial), clients: Vec::new(), worker, port, port_out, stats }
    }

    fn current_config(&self) -> Arc<DfrConfig> { self.config.load_full() }

    /// Kills every currently-running client task, mirroring
    /// `kill_current_clients`'s sequential `client.close()` loop --
    /// cancellation here is concurrent (every handle gets `cancel()`
    /// first) but we still wait for each task to actually exit before
    /// returning, preserving the "all clients gone" postcondition.
    async fn kill_current_clients(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        for handle in &self.clients {
            handle.shutdown.cancel();
        }
        for handle in self.clients.drain(..) {
            let _ = handle.task.await;
        }
        tracing::info!("dfr clients killed");
    }

    /// Spawns `clients_per_backend` client tasks per configured backend,
    /// mirroring `start_clients`/`start_client`.
    fn start_clients(&mut self) {
        let config = self.current_config();
        for backend in &config.backends {
            for _ in 0..config.clients_per_backend {
                let shutdown = CancellationToken::new();
                let worker = self.worker.clone();
                let backend = backend.clone();
                let child_shutdown = shutdown.clone();
                let task = tokio::spawn(async move { worker::run(worker, backend, child_shutdown).await });
                self.clients.push(ClientHandle { shutdown, task });
            }
        }
        tracing::info!(backends = config.backends.len(), per_backend = config.clients_per_backend, "dfr clients started");
    }

    async fn restart_clients(&mut self) {
        tracing::info!("restarting dfr clients");
        self.kill_current_clients().await;
        self.start_clients();
    }

    fn show_config(&self) -> ShowConfigReply {
        let config = self.current_config();
        ShowConfigReply {
            port: self.port,
            port_out: self.port_out,
            num_workers: self.clients.len(),
            clients_per_backend: config.clients_per_backend,
            backends: config.backends.clone(),
            stats: self.stats.snapshot(),
            server_version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Applies a new backend list / fan-out width, restarting every
    /// client against the new configuration -- mirrors the
    /// `ServerCmd.switch_server` branch's "adopt new config, then
    /// restart_clients()" sequence. A config with an empty backend list
    /// or zero clients-per-backend leaves the current values unchanged,
    /// matching the original's `if new_remote_server:` / `if
    /// new_client_number > 0:` guards.
    async fn switch(&mut self, req: control::SwitchRequest) {
        let mut next = (*self.current_config()).clone();
        if !req.backends.is_empty() {
            next.backends = req.backends;
        }
        if req.clients_per_backend > 0 {
            next.clients_per_backend = req.clients_per_backend;
        }
        self.config.store(Arc::new(next));
        self.restart_clients().await;
    }

    /// Runs the command loop: binds a PULL-style frame listener on
    /// `command_stream` and a reply sender for `ShowConfig`/`Switch`, and
    /// processes commands strictly serially (P6) since this is a single
    /// task with no parallel command consumers. Returns after a
    /// `Terminate` command, having killed every client first.
    pub async fn run(mut self, command_stream: tokio::net::TcpStream, reply_tx: mpsc::Sender<Vec<u8>>) {
        self.start_clients();

        let mut framed = Framed::new(command_stream, FrameCodec::default());
        use futures::StreamExt;

        loop {
            let frame = match framed.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    tracing::error!(error = %err, "dfr control frame decode error");
                    continue;
                },
                None => break,
            };

            match control::parse_command(&frame) {
                Ok(DfrCommand::Terminate) => {
                    tracing::info!("dfr terminate command received");
                    break;
                },
                Ok(DfrCommand::Idle) => {
                    tracing::info!("dfr idle command received");
                    self.kill_current_clients().await;
                },
                Ok(DfrCommand::RestartClients) => self.restart_clients().await,
                Ok(DfrCommand::ShowConfig) => {
                    let reply = self.show_config();
                    let _ = reply_tx.send(serde_json::to_vec(&reply).unwrap_or_default()).await;
                },
                Ok(DfrCommand::Switch(req)) => {
                    self.switch(req).await;
                    let reply = SwitchReply { success: true };
                    let _ = reply_tx.send(serde_json::to_vec(&reply).unwrap_or_default()).await;
                },
                Err(err) => {
                    tracing::error!(error = %err, "malformed dfr control frame");
                },
            }
        }

        self.kill_current_clients().await;
        tracing::info!("dfr control plane terminated");
    }
}

/// Validates a DFR configuration has at least one backend, failing fast
/// at startup rather than running a fan-out with nothing to fan out to
/// (spec.md 4.4's "at least one target" contract generalized to DFR).
pub fn validate_config(config: &DfrConfig) -> Result<(), ControlError> {
    if config.backends.is_empty() {
        return Err(ControlError::NoBackends);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_backend_list() {
        let config = DfrConfig { backends: vec![], clients_per_backend: 1 };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn accepts_nonempty_backend_list() {
        let config = DfrConfig {
            backends: vec![BackendAddr { host: "h".into(), port: 1, port_out: 2 }],
            clients_per_backend: 1,
        };
        assert!(validate_config(&config).is_ok());
    }
}
