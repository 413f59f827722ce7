//! Outbound control connection to the broker
//!
//! Each polling cycle opens a brand-new mutually-authenticated connection,
//! announces the client with `Hello`, and reacts to whatever the broker
//! answers. A `CreateTunnel` spawns the tunnel task, which runs the relay
//! between the control stream and the dialed local service.

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use nb_core::config::AgentConfig;
use nb_core::error::ConfigError;
use nb_core::tls;
use nb_core::ProxySession;
use nb_protocol::{
    FramedReader, FramedWriter, Message, ProtocolError, SharedWriter, PROTOCOL_VERSION,
};

/// Connection-cycle errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connecting to the broker took longer than the configured timeout
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// The broker reported a fatal per-connection error
    #[error("Broker reported: {0}")]
    Broker(String),

    /// Protocol violation on the control stream
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Underlying transport failure
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// How one polling cycle ended
pub enum CycleOutcome {
    /// The broker had work; the tunnel task is running
    TunnelStarted(JoinHandle<()>),
    /// Nothing pending for this client right now
    NotInterested,
}

/// Opens control connections to the broker
pub struct TunnelConnector {
    config: AgentConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TunnelConnector {
    /// Build the TLS context from the agent configuration.
    ///
    /// Unusable certificate material surfaces here, before any connection
    /// is attempted.
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        let connector =
            tls::build_connector(&config.cert_path, &config.key_path, &config.ca_path)?;
        let server_name = tls::server_name(&config.tls_server_name()?)?;
        Ok(Self {
            config,
            connector,
            server_name,
        })
    }

    /// Run one polling cycle over a fresh control connection.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, ConnectionError> {
        let address = &self.config.broker_address;
        tracing::info!(
            "Trying to connect {} (client name {:?})...",
            address,
            self.config.client_name()
        );

        let tcp = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ConnectionError::Timeout(address.clone()))??;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        tracing::debug!("Connection established");

        run_control_cycle(stream, self.config.client_name()).await
    }
}

/// Drive one control connection: `Hello`, then the broker's answer.
///
/// Generic over the stream so tests can script the broker side over plain
/// TCP; production passes the TLS client stream.
pub async fn run_control_cycle<S>(
    stream: S,
    name: String,
) -> Result<CycleOutcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = FramedReader::new(rd);
    let writer = SharedWriter::new(FramedWriter::new(wr));

    writer
        .send(&Message::Hello {
            name,
            protocol_version: PROTOCOL_VERSION,
        })
        .await?;

    match reader.read_message().await? {
        Message::CreateTunnel { port } => {
            tracing::debug!("Requested to create tunnel with local port {}", port);
            let handle = tokio::spawn(run_tunnel(reader, writer, port));
            Ok(CycleOutcome::TunnelStarted(handle))
        }
        Message::NotInterested => {
            tracing::info!("Nobody interested in a tunnel, disconnecting");
            let _ = writer.shutdown().await;
            Ok(CycleOutcome::NotInterested)
        }
        Message::Error { message } => Err(ConnectionError::Broker(message)),
        other => Err(ProtocolError::UnexpectedMessage {
            expected: "CREATE_TUNNEL or NOT_INTERESTED",
            got: other.name(),
        }
        .into()),
    }
}

/// Tunnel task: await `Connect`, dial the local service, run the relay.
async fn run_tunnel<R, W>(reader: FramedReader<R>, writer: SharedWriter<W>, port: u16)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = run_tunnel_inner(reader, writer, port).await {
        tracing::warn!("Tunnel on local port {} failed: {}", port, e);
    }
}

async fn run_tunnel_inner<R, W>(
    mut reader: FramedReader<R>,
    writer: SharedWriter<W>,
    port: u16,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let caller = match reader.read_message().await? {
        Message::Connect {
            original_client_address,
        } => original_client_address,
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "CONNECT",
                got: other.name(),
            }
            .into())
        }
    };

    tracing::info!("Connecting with local port {} for remote caller {}...", port, caller);
    let local = TcpStream::connect(("localhost", port)).await?;
    tracing::info!("Connection established with local port {}", port);

    let session = ProxySession::new(
        reader,
        writer.clone(),
        local,
        format!("localhost:{} <- {}", port, caller),
    );
    let result = session.run().await;

    // Orderly tear-down on top of whatever the relay already sent; the
    // broker may be gone, so both steps are best-effort.
    tracing::debug!("Closing tunnel...");
    let _ = writer.send(&Message::Disconnect).await;
    let _ = writer.shutdown().await;

    result?;
    Ok(())
}
