//! Per-connection handshake handler
//!
//! Drives one inbound control connection through the handshake state
//! machine and, on a match, into the relay. Failures are isolated to the
//! connection: the peer gets a best-effort `Error` message and the stream
//! is closed; other connections and table entries are untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use nb_core::ProxySession;
use nb_protocol::{
    check_protocol_version, FramedReader, FramedWriter, Message, ProtocolError, SharedWriter,
};

use crate::forward::ForwardListener;
use crate::requests::TunnelTarget;
use crate::state::BrokerState;

/// Where the handshake ended up before the relay stage
enum HandshakeOutcome {
    /// No pending request; the client was told and will retry later
    NotInterested,
    /// Matched: the external caller's stream is in hand
    Tunnel {
        client: String,
        stream: TcpStream,
        caller_addr: SocketAddr,
    },
}

/// Handle one inbound control connection to completion.
///
/// Generic over the stream so integration tests can drive the handshake
/// over plain TCP; production passes the TLS-accepted stream.
pub async fn handle_control_connection<S>(
    state: Arc<BrokerState>,
    stream: S,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = FramedReader::new(rd);
    let writer = SharedWriter::new(FramedWriter::new(wr));

    match run_handshake(&state, &mut reader, &writer, peer_addr, &cancel).await {
        Ok(HandshakeOutcome::NotInterested) => {}
        Ok(HandshakeOutcome::Tunnel {
            client,
            stream,
            caller_addr,
        }) => {
            let session = ProxySession::new(
                reader,
                writer.clone(),
                stream,
                format!("{} <- {}", client, caller_addr),
            );
            if let Err(e) = session.run().await {
                tracing::warn!("Tunnel for {:?} from {} ended with error: {}", client, caller_addr, e);
            }
        }
        Err(e) => {
            tracing::warn!("Control connection from {} failed: {}", peer_addr, e);
            // Peer may be gone already; notification is best-effort.
            let _ = writer
                .send(&Message::Error {
                    message: e.to_string(),
                })
                .await;
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!("Control connection from {} closed", peer_addr);
}

async fn run_handshake<R, W>(
    state: &BrokerState,
    reader: &mut FramedReader<R>,
    writer: &SharedWriter<W>,
    peer_addr: SocketAddr,
    cancel: &CancellationToken,
) -> Result<HandshakeOutcome, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::debug!("Client connected from {}", peer_addr);

    let (name, protocol_version) = match reader.read_message().await? {
        Message::Hello {
            name,
            protocol_version,
        } => (name, protocol_version),
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "HELLO",
                got: other.name(),
            })
        }
    };
    tracing::debug!("Client name: {:?} (protocol version {})", name, protocol_version);

    check_protocol_version(protocol_version)?;

    let Some(request) = state.requests.try_consume(&name) else {
        tracing::info!(
            "Client {:?} connected, but no pending requests for it - disconnecting",
            name
        );
        writer.send(&Message::NotInterested).await?;
        return Ok(HandshakeOutcome::NotInterested);
    };

    tracing::info!(
        "Client {:?} will forward its port {} through this connection",
        name,
        request.client_port
    );
    writer
        .send(&Message::CreateTunnel {
            port: request.client_port,
        })
        .await?;

    let (stream, caller_addr) = match request.target {
        TunnelTarget::Incoming { stream, peer_addr } => (stream, peer_addr),
        TunnelTarget::ServerPort(port) => {
            if let Some(forward) = state.permanent_forward(port) {
                tracing::info!("Waiting for a caller on service port {}", forward.local_addr());
                forward.wait_conn(&state.requests, cancel).await?
            } else {
                let listener = ForwardListener::bind(port).await?;
                tracing::info!("Waiting for a caller on {}", listener.local_addr()?);
                listener.accept_one(cancel).await?
            }
        }
    };
    tracing::info!("Incoming connection to be tunneled from {}", caller_addr);

    writer
        .send(&Message::Connect {
            original_client_address: caller_addr.to_string(),
        })
        .await?;

    Ok(HandshakeOutcome::Tunnel {
        client: name,
        stream,
        caller_addr,
    })
}
