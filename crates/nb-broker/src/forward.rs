//! Forward listeners
//!
//! An ephemeral [`ForwardListener`] accepts exactly one external caller and
//! is then discarded. A [`PermanentForward`] is bound for the process
//! lifetime to one configured service: each accepted caller is delivered
//! straight to a handshake already parked on the listener, or buffered into
//! the pending-request table.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use nb_core::config::{BrokerConfig, ServiceConfig};

use crate::requests::{PendingRequest, RequestTable, TunnelTarget};

/// Tick between registration retries for a held caller
const REGISTER_RETRY_TICK: Duration = Duration::from_millis(250);

/// Attempts before a held caller is dropped (about 10 seconds)
const MAX_REGISTER_ATTEMPTS: u32 = 40;

/// One-shot listener for an ephemeral tunnel target.
pub struct ForwardListener {
    listener: TcpListener,
}

impl ForwardListener {
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept exactly one connection, then release the socket.
    ///
    /// Aborts with `Interrupted` when the broker shuts down.
    pub async fn accept_one(
        self,
        cancel: &CancellationToken,
    ) -> io::Result<(TcpStream, SocketAddr)> {
        tokio::select! {
            _ = cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "broker shutting down",
            )),
            accepted = self.listener.accept() => accepted,
        }
    }
}

/// Permanent listener for one configured forwarding service.
pub struct PermanentForward {
    client: String,
    target_port: u16,
    local_addr: SocketAddr,
    /// Handshake parked waiting for the next accepted caller, if any
    waiter: Mutex<Option<oneshot::Sender<(TcpStream, SocketAddr)>>>,
}

impl PermanentForward {
    /// Bind the service port and spawn its accept loop.
    pub async fn spawn(
        name: &str,
        service: &ServiceConfig,
        table: Arc<RequestTable>,
        cancel: CancellationToken,
    ) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", service.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Service {:?}: listening on {} for client {:?} port {}",
            name,
            local_addr,
            service.client,
            service.target_port
        );

        let forward = Arc::new(Self {
            client: service.client.clone(),
            target_port: service.target_port,
            local_addr,
            waiter: Mutex::new(None),
        });

        let accept_loop = Arc::clone(&forward);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(
                            "Service listener on {} shutting down",
                            accept_loop.local_addr
                        );
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                tracing::info!(
                                    "Incoming connection from {} for client {:?}",
                                    peer_addr,
                                    accept_loop.client
                                );
                                let forward = Arc::clone(&accept_loop);
                                let table = Arc::clone(&table);
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    forward.handle_caller(table, stream, peer_addr, cancel).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept on service port: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(forward)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Park the calling handshake until the next caller is accepted.
    pub async fn wait_conn(
        &self,
        table: &RequestTable,
        cancel: &CancellationToken,
    ) -> io::Result<(TcpStream, SocketAddr)> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.waiter.lock().await;
            if slot.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "another handshake is already waiting on this service",
                ));
            }
            *slot = Some(tx);
        }

        // A caller may have been buffered between the handshake's table
        // lookup and the park above; drain it so neither side waits on
        // the other.
        if let Some(request) = table.try_consume(&self.client) {
            match request.target {
                TunnelTarget::Incoming { stream, peer_addr } => {
                    self.waiter.lock().await.take();
                    return Ok((stream, peer_addr));
                }
                target => {
                    // Not a buffered caller (e.g. an admin-registered
                    // request); put it back untouched.
                    let _ = table.try_register(
                        &self.client,
                        PendingRequest {
                            client_port: request.client_port,
                            target,
                        },
                    );
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.waiter.lock().await.take();
                Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "broker shutting down",
                ))
            }
            delivered = rx => delivered.map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "service listener closed")
            }),
        }
    }

    /// Deliver a caller to the parked handshake, or buffer it in the table.
    ///
    /// A second caller while the client's slot is occupied is held and
    /// retried on a tick; it is never dropped without a log line.
    async fn handle_caller(
        &self,
        table: Arc<RequestTable>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) {
        let mut stream = stream;
        for attempt in 0..MAX_REGISTER_ATTEMPTS {
            if let Some(tx) = self.waiter.lock().await.take() {
                match tx.send((stream, peer_addr)) {
                    Ok(()) => {
                        tracing::debug!(
                            "Caller {} delivered to waiting handshake for {:?}",
                            peer_addr,
                            self.client
                        );
                        return;
                    }
                    Err((returned, _)) => {
                        // The handshake died between parking and delivery.
                        stream = returned;
                    }
                }
            }

            let request = PendingRequest {
                client_port: self.target_port,
                target: TunnelTarget::Incoming {
                    stream,
                    peer_addr,
                },
            };
            match table.try_register(&self.client, request) {
                Ok(()) => {
                    tracing::info!(
                        "Caller {} buffered for client {:?} (port {})",
                        peer_addr,
                        self.client,
                        self.target_port
                    );
                    return;
                }
                Err(rejected) => {
                    match rejected.target {
                        TunnelTarget::Incoming { stream: s, .. } => stream = s,
                        TunnelTarget::ServerPort(_) => unreachable!("registered an Incoming target"),
                    }
                    if attempt == 0 {
                        tracing::warn!(
                            "Client {:?} already has a pending request; holding caller {}",
                            self.client,
                            peer_addr
                        );
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Dropping held caller {}: broker shutting down", peer_addr);
                    return;
                }
                _ = tokio::time::sleep(REGISTER_RETRY_TICK) => {}
            }
        }

        tracing::warn!(
            "Dropping caller {} for client {:?}: slot still occupied after {} attempts",
            peer_addr,
            self.client,
            MAX_REGISTER_ATTEMPTS
        );
    }
}

/// Bind every configured service and seed its pending request.
///
/// The seeded `ServerPort` entry lets a client that polls before any
/// external caller arrives park on the permanent listener.
pub async fn start_services(
    config: &BrokerConfig,
    table: &Arc<RequestTable>,
    cancel: &CancellationToken,
) -> io::Result<HashMap<u16, Arc<PermanentForward>>> {
    let mut forwards = HashMap::new();
    for (name, service) in &config.services {
        let forward =
            PermanentForward::spawn(name, service, Arc::clone(table), cancel.clone()).await?;
        forwards.insert(service.listen_port, forward);

        let seed = PendingRequest {
            client_port: service.target_port,
            target: TunnelTarget::ServerPort(service.listen_port),
        };
        if table.try_register(&service.client, seed).is_err() {
            tracing::warn!(
                "Client {:?} already seeded by another service; {:?} will rely on buffered callers",
                service.client,
                name
            );
        }
    }
    Ok(forwards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn service(client: &str, target_port: u16) -> ServiceConfig {
        ServiceConfig {
            listen_port: 0,
            client: client.to_string(),
            target_port,
        }
    }

    #[tokio::test]
    async fn test_ephemeral_listener_accepts_exactly_one() {
        let cancel = CancellationToken::new();
        let listener = ForwardListener::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut caller = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept_one(&cancel).await.unwrap();
        assert_eq!(peer_addr, caller.local_addr().unwrap());
        drop(stream);
        caller.shutdown().await.ok();

        // The socket is released with the listener; a fresh bind succeeds.
        drop(ForwardListener::bind(addr.port()).await.unwrap());
    }

    #[tokio::test]
    async fn test_ephemeral_accept_aborts_on_shutdown() {
        let cancel = CancellationToken::new();
        let listener = ForwardListener::bind(0).await.unwrap();

        cancel.cancel();
        let err = listener.accept_one(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_caller_is_buffered_when_no_handshake_waits() {
        let cancel = CancellationToken::new();
        let table = Arc::new(RequestTable::new());
        let forward = PermanentForward::spawn("svc", &service("alice", 22), Arc::clone(&table), cancel.clone())
            .await
            .unwrap();

        let _caller = TcpStream::connect(forward.local_addr()).await.unwrap();

        // The accept loop runs asynchronously; poll for the registration.
        for _ in 0..50 {
            if let Some(request) = table.try_consume("alice") {
                assert_eq!(request.client_port, 22);
                assert!(matches!(request.target, TunnelTarget::Incoming { .. }));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("caller never buffered");
    }

    #[tokio::test]
    async fn test_caller_is_delivered_to_parked_handshake() {
        let cancel = CancellationToken::new();
        let table = Arc::new(RequestTable::new());
        let forward = PermanentForward::spawn("svc", &service("alice", 22), Arc::clone(&table), cancel.clone())
            .await
            .unwrap();

        // Parking happens on the first poll of wait_conn, before the
        // delayed caller dials in.
        let parked_forward = Arc::clone(&forward);
        let parked_table = Arc::clone(&table);
        let parked_cancel = cancel.clone();
        let (delivered, caller) = tokio::join!(
            async move {
                parked_forward
                    .wait_conn(&parked_table, &parked_cancel)
                    .await
                    .unwrap()
            },
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                TcpStream::connect(forward.local_addr()).await.unwrap()
            },
        );
        let (_stream, peer_addr) = delivered;
        assert_eq!(peer_addr, caller.local_addr().unwrap());

        // Delivered directly, not via the table.
        assert!(table.try_consume("alice").is_none());
    }

    #[tokio::test]
    async fn test_wait_conn_drains_a_caller_buffered_meanwhile() {
        let cancel = CancellationToken::new();
        let table = Arc::new(RequestTable::new());
        let forward = PermanentForward::spawn("svc", &service("alice", 22), Arc::clone(&table), cancel.clone())
            .await
            .unwrap();

        // The caller lands in the table before any handshake parks.
        let caller = TcpStream::connect(forward.local_addr()).await.unwrap();
        let caller_addr = caller.local_addr().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Parking after the buffering must still pick the caller up.
        let (_stream, peer_addr) = forward.wait_conn(&table, &cancel).await.unwrap();
        assert_eq!(peer_addr, caller_addr);
        assert!(table.try_consume("alice").is_none());
    }

    #[tokio::test]
    async fn test_second_caller_held_until_slot_drains() {
        let cancel = CancellationToken::new();
        let table = Arc::new(RequestTable::new());
        let forward = PermanentForward::spawn("svc", &service("alice", 22), Arc::clone(&table), cancel.clone())
            .await
            .unwrap();

        let _first = TcpStream::connect(forward.local_addr()).await.unwrap();
        let _second = TcpStream::connect(forward.local_addr()).await.unwrap();

        // One of the two is buffered; consume it, the held one lands next.
        let mut drained = 0;
        for _ in 0..100 {
            if table.try_consume("alice").is_some() {
                drained += 1;
                if drained == 2 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("held caller never registered, drained {}", drained);
    }
}
