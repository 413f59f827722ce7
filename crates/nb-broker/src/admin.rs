//! Administrative command channel
//!
//! Optional line-oriented control surface, enabled by `admin_bind_address`
//! and protected by the same mutual-TLS acceptor as the control listener.
//! Lets an operator register and withdraw ephemeral pending requests at
//! runtime, and request broker shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::requests::{PendingRequest, TunnelTarget};
use crate::state::BrokerState;

const BANNER: &str = "natbridge broker";

const COMMAND_WAITFOR: &str = "WAITFOR";
const COMMAND_NOWAIT: &str = "NOWAIT";
const COMMAND_EXIT: &str = "EXIT";
const COMMAND_KILL: &str = "KILL";

/// What a command asks the connection loop to do next
enum AdminAction {
    /// Answer and keep reading commands
    Reply(String),
    /// Answer and close this admin connection
    Exit(String),
    /// Answer, then shut the whole broker down
    Kill(String),
}

/// TLS server for the administrative channel
pub struct AdminServer {
    listener: TcpListener,
    state: Arc<BrokerState>,
    acceptor: TlsAcceptor,
    cancel: CancellationToken,
}

impl AdminServer {
    pub async fn bind(
        state: Arc<BrokerState>,
        acceptor: TlsAcceptor,
        cancel: CancellationToken,
        bind_addr: &str,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind admin channel to {}", bind_addr))?;

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
        tracing::info!("Admin channel on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Admin channel shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let acceptor = self.acceptor.clone();
                            let state = Arc::clone(&self.state);
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let stream = match acceptor.accept(socket).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        tracing::warn!(
                                            "Admin TLS handshake with {} failed: {}",
                                            peer_addr,
                                            e
                                        );
                                        return;
                                    }
                                };
                                handle_admin_connection(state, stream, peer_addr, cancel).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept admin connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Handle one admin connection; errors are logged and stay local to it.
pub async fn handle_admin_connection<S>(
    state: Arc<BrokerState>,
    stream: S,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::info!("Controller connected from {}", peer_addr);

    let (rd, mut wr) = tokio::io::split(stream);
    let mut lines = BufReader::new(rd).lines();

    if let Err(e) = send_line(&mut wr, BANNER).await {
        tracing::warn!("Admin connection from {} failed: {}", peer_addr, e);
        return;
    }

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Admin connection from {} failed: {}", peer_addr, e);
                break;
            }
        };
        tracing::debug!("Admin command from {}: {:?}", peer_addr, line);

        let action = apply_command(&state, line.trim());
        let (reply, done, kill) = match action {
            AdminAction::Reply(reply) => (reply, false, false),
            AdminAction::Exit(reply) => (reply, true, false),
            AdminAction::Kill(reply) => (reply, true, true),
        };

        tracing::info!("Admin response to {}: {:?}", peer_addr, reply);
        if let Err(e) = send_line(&mut wr, &reply).await {
            tracing::warn!("Admin connection from {} failed: {}", peer_addr, e);
            break;
        }
        if kill {
            cancel.cancel();
        }
        if done {
            break;
        }
    }

    let _ = wr.shutdown().await;
    tracing::debug!("Admin connection from {} closed", peer_addr);
}

async fn send_line<W>(wr: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(format!("{}\n", line).as_bytes()).await
}

/// Parse and apply one command line against the broker state.
fn apply_command(state: &BrokerState, line: &str) -> AdminAction {
    let parts: Vec<&str> = line.split_whitespace().collect();

    match parts.as_slice() {
        [COMMAND_WAITFOR, client, client_port, server_port] => {
            let (Ok(client_port), Ok(server_port)) =
                (client_port.parse::<u16>(), server_port.parse::<u16>())
            else {
                return AdminAction::Reply("Invalid port number".to_string());
            };

            let request = PendingRequest {
                client_port,
                target: TunnelTarget::ServerPort(server_port),
            };
            match state.requests.try_register(client, request) {
                Ok(()) => AdminAction::Reply(format!(
                    "Client {:?} is added to requests table with port {} forwarding to {}",
                    client, client_port, server_port
                )),
                Err(_) => AdminAction::Reply(format!(
                    "Client {:?} already exists in requests table",
                    client
                )),
            }
        }

        [COMMAND_NOWAIT, client] => {
            if state.requests.remove(client) {
                AdminAction::Reply(format!("Client {:?} is removed from requests table", client))
            } else {
                AdminAction::Reply(format!(
                    "Client {:?} does not exist in requests table",
                    client
                ))
            }
        }

        [COMMAND_EXIT] => AdminAction::Exit("Exiting".to_string()),

        [COMMAND_KILL] => AdminAction::Kill("Killing broker".to_string()),

        _ => AdminAction::Reply("Unknown command".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_core::config::BrokerConfig;
    use std::collections::HashMap;
    use crate::requests::RequestTable;

    fn state() -> Arc<BrokerState> {
        Arc::new(BrokerState::new(
            BrokerConfig::default(),
            Arc::new(RequestTable::new()),
            HashMap::new(),
        ))
    }

    fn reply(action: AdminAction) -> String {
        match action {
            AdminAction::Reply(s) | AdminAction::Exit(s) | AdminAction::Kill(s) => s,
        }
    }

    #[test]
    fn test_waitfor_registers_and_conflicts() {
        let state = state();

        let first = reply(apply_command(&state, "WAITFOR alice 22 9022"));
        assert!(first.contains("added"));

        let request = state.requests.try_consume("alice").unwrap();
        assert_eq!(request.client_port, 22);
        assert!(matches!(request.target, TunnelTarget::ServerPort(9022)));

        apply_command(&state, "WAITFOR alice 22 9022");
        let conflict = reply(apply_command(&state, "WAITFOR alice 80 9080"));
        assert!(conflict.contains("already exists"));
    }

    #[test]
    fn test_nowait_reports_existence() {
        let state = state();
        apply_command(&state, "WAITFOR alice 22 9022");

        assert!(reply(apply_command(&state, "NOWAIT alice")).contains("removed"));
        assert!(reply(apply_command(&state, "NOWAIT alice")).contains("does not exist"));
        assert!(state.requests.try_consume("alice").is_none());
    }

    #[test]
    fn test_garbage_lines_are_reported() {
        let state = state();
        assert_eq!(reply(apply_command(&state, "")), "Unknown command");
        assert_eq!(reply(apply_command(&state, "FROBNICATE")), "Unknown command");
        assert_eq!(
            reply(apply_command(&state, "WAITFOR alice notaport 9022")),
            "Invalid port number"
        );
    }

    #[tokio::test]
    async fn test_admin_session_over_stream() {
        let state = state();
        let cancel = CancellationToken::new();

        let (near, far) = tokio::io::duplex(4096);
        let peer_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = tokio::spawn(handle_admin_connection(
            Arc::clone(&state),
            near,
            peer_addr,
            cancel.clone(),
        ));

        let (rd, mut wr) = tokio::io::split(far);
        let mut lines = BufReader::new(rd).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), BANNER);

        wr.write_all(b"WAITFOR alice 22 9022\n").await.unwrap();
        assert!(lines.next_line().await.unwrap().unwrap().contains("added"));

        wr.write_all(b"EXIT\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Exiting");

        session.await.unwrap();
        assert!(state.requests.try_consume("alice").is_some());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_kill_cancels_the_broker() {
        let state = state();
        let cancel = CancellationToken::new();

        let (near, far) = tokio::io::duplex(4096);
        let peer_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = tokio::spawn(handle_admin_connection(
            state,
            near,
            peer_addr,
            cancel.clone(),
        ));

        let (rd, mut wr) = tokio::io::split(far);
        let mut lines = BufReader::new(rd).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), BANNER);

        wr.write_all(b"KILL\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "Killing broker");

        session.await.unwrap();
        assert!(cancel.is_cancelled());
    }
}
