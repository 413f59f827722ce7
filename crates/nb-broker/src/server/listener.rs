//! Control-connection listener
//!
//! Accepts inbound TCP connections, performs the mutual-TLS handshake, and
//! spawns one handler task per control connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::server::handler::handle_control_connection;
use crate::state::BrokerState;

/// TLS server accepting control connections from client agents
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<BrokerState>,
    acceptor: TlsAcceptor,
    cancel: CancellationToken,
}

impl ControlServer {
    /// Bind the control listener.
    pub async fn bind(
        state: Arc<BrokerState>,
        acceptor: TlsAcceptor,
        cancel: CancellationToken,
        bind_addr: &str,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            listener,
            state,
            acceptor,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Control listener on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Control listener shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// TLS-accept and handle a new connection on its own task.
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New connection from {}", peer_addr);

        let acceptor = self.acceptor.clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("TLS handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            handle_control_connection(state, stream, peer_addr, cancel).await;
        });
    }
}
