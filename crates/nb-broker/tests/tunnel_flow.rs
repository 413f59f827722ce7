//! End-to-end handshake and relay scenarios
//!
//! These drive the per-connection handler over plain TCP; the TLS layer is
//! exercised separately in `tls_stack.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use nb_broker::forward;
use nb_broker::requests::{PendingRequest, RequestTable, TunnelTarget};
use nb_broker::server::handle_control_connection;
use nb_broker::BrokerState;
use nb_core::config::{BrokerConfig, ServiceConfig};
use nb_core::ProxySession;
use nb_protocol::{
    FramedReader, FramedWriter, Message, SharedWriter, MAX_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

/// A connected TCP pair plus the accepted side's peer address.
async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer_addr) = listener.accept().await.unwrap();
    (client, server, peer_addr)
}

fn empty_state() -> Arc<BrokerState> {
    Arc::new(BrokerState::new(
        BrokerConfig::default(),
        Arc::new(RequestTable::new()),
        Default::default(),
    ))
}

#[tokio::test]
async fn test_permanent_service_ping_roundtrip() {
    let cancel = CancellationToken::new();
    let requests = Arc::new(RequestTable::new());

    // The service on the agent's machine.
    let service_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = service_listener.local_addr().unwrap().port();

    let mut config = BrokerConfig::default();
    config.services.insert(
        "ping".to_string(),
        ServiceConfig {
            listen_port: 0,
            client: "alice".to_string(),
            target_port,
        },
    );

    let forwards = forward::start_services(&config, &requests, &cancel)
        .await
        .unwrap();
    let forward_addr = forwards[&0].local_addr();
    let state = Arc::new(BrokerState::new(config, requests, forwards));

    // External caller arrives first and sends its bytes.
    let mut caller = TcpStream::connect(forward_addr).await.unwrap();
    let caller_addr = caller.local_addr().unwrap();
    caller.write_all(b"PING\n").await.unwrap();

    // Agent opens its control connection.
    let (agent_stream, broker_stream, agent_peer) = tcp_pair().await;
    tokio::spawn(handle_control_connection(
        Arc::clone(&state),
        broker_stream,
        agent_peer,
        cancel.clone(),
    ));

    let (rd, wr) = tokio::io::split(agent_stream);
    let mut reader = FramedReader::new(rd);
    let writer = SharedWriter::new(FramedWriter::new(wr));
    writer
        .send(&Message::Hello {
            name: "alice".to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();

    match reader.read_message().await.unwrap() {
        Message::CreateTunnel { port } => assert_eq!(port, target_port),
        other => panic!("expected CREATE_TUNNEL, got {}", other.name()),
    }
    match reader.read_message().await.unwrap() {
        Message::Connect {
            original_client_address,
        } => assert_eq!(original_client_address, caller_addr.to_string()),
        other => panic!("expected CONNECT, got {}", other.name()),
    }

    // Agent dials its local service and relays.
    let local = TcpStream::connect(("127.0.0.1", target_port)).await.unwrap();
    let agent_session = tokio::spawn(
        ProxySession::new(reader, writer.clone(), local, "ping service").run(),
    );

    let (mut service_conn, _) = service_listener.accept().await.unwrap();
    let mut request = [0u8; 5];
    service_conn.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"PING\n");
    service_conn.write_all(b"PONG\n").await.unwrap();
    drop(service_conn);

    let mut reply = [0u8; 5];
    caller.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PONG\n");

    // And the caller's stream drains to EOF once the tunnel closes.
    let mut rest = Vec::new();
    caller.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    agent_session.await.unwrap().ok();
}

#[tokio::test]
async fn test_unknown_client_gets_not_interested() {
    let cancel = CancellationToken::new();
    let state = empty_state();

    let (agent_stream, broker_stream, agent_peer) = tcp_pair().await;
    tokio::spawn(handle_control_connection(
        state,
        broker_stream,
        agent_peer,
        cancel,
    ));

    let (rd, wr) = tokio::io::split(agent_stream);
    let mut reader = FramedReader::new(rd);
    let writer = SharedWriter::new(FramedWriter::new(wr));
    writer
        .send(&Message::Hello {
            name: "bob".to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await
        .unwrap();

    // One round trip: NOT_INTERESTED, then the broker closes. No
    // CREATE_TUNNEL is ever seen.
    assert_eq!(reader.read_message().await.unwrap(), Message::NotInterested);
    assert!(reader.read_message().await.is_err());
}

#[tokio::test]
async fn test_too_new_version_rejected_without_consuming() {
    let cancel = CancellationToken::new();
    let state = empty_state();
    state
        .requests
        .try_register(
            "carol",
            PendingRequest {
                client_port: 22,
                target: TunnelTarget::ServerPort(9022),
            },
        )
        .unwrap();

    let (agent_stream, broker_stream, agent_peer) = tcp_pair().await;
    tokio::spawn(handle_control_connection(
        Arc::clone(&state),
        broker_stream,
        agent_peer,
        cancel,
    ));

    let (rd, wr) = tokio::io::split(agent_stream);
    let mut reader = FramedReader::new(rd);
    let writer = SharedWriter::new(FramedWriter::new(wr));
    writer
        .send(&Message::Hello {
            name: "carol".to_string(),
            protocol_version: MAX_PROTOCOL_VERSION + 1,
        })
        .await
        .unwrap();

    match reader.read_message().await.unwrap() {
        Message::Error { message } => {
            assert!(message.contains("protocol version"), "got {:?}", message)
        }
        other => panic!("expected ERROR, got {}", other.name()),
    }

    // The pending request must survive the rejected handshake.
    assert!(state.requests.try_consume("carol").is_some());
}

#[tokio::test]
async fn test_first_message_must_be_hello() {
    let cancel = CancellationToken::new();
    let state = empty_state();

    let (agent_stream, broker_stream, agent_peer) = tcp_pair().await;
    tokio::spawn(handle_control_connection(
        state,
        broker_stream,
        agent_peer,
        cancel,
    ));

    let (rd, wr) = tokio::io::split(agent_stream);
    let mut reader = FramedReader::new(rd);
    let writer = SharedWriter::new(FramedWriter::new(wr));
    writer.send(&Message::Disconnect).await.unwrap();

    match reader.read_message().await.unwrap() {
        Message::Error { message } => assert!(message.contains("HELLO"), "got {:?}", message),
        other => panic!("expected ERROR, got {}", other.name()),
    }
}
