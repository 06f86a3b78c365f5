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
//! The acceptor (C6): binds the listening socket and hands accepted
//! connections to sink tasks via a bounded queue. Generalizes
//! `listener.rs`'s `get_listener`/`build_router_chain` accept loop. See
//! spec.md 4.6.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::CreationError;

/// Binds a listening socket with `SO_REUSEADDR`/`SO_REUSEPORT` set, the
/// same flags `listener.rs::get_listener` sets via `net2::TcpBuilder` --
/// `socket2` is the maintained, non-deprecated successor for the same
/// purpose.
pub fn bind(addr: SocketAddr) -> Result<TcpListener, CreationError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(CreationError::BindFailed)?;
    socket.set_reuse_address(true).map_err(CreationError::BindFailed)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(CreationError::BindFailed)?;
    socket.set_nonblocking(true).map_err(CreationError::BindFailed)?;
    socket.bind(&addr.into()).map_err(CreationError::BindFailed)?;
    socket.listen(1024).map_err(CreationError::BindFailed)?;

    TcpListener::from_std(socket.into()).map_err(CreationError::BindFailed)
}

/// Accepts connections until `shutdown` fires, pushing each into
/// `connections`. A full `connections` queue applies natural backpressure
/// on accepting further clients, matching the bounded-channel pattern
/// `listener.rs` uses between accept and pipeline spawn.
pub async fn run(listener: TcpListener, connections: mpsc::Sender<TcpStream>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("acceptor shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        if connections.send(stream).await.is_err() {
                            tracing::info!("connection queue closed, acceptor stopping");
                            return;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    },
                }
            }
        }
    }
}
