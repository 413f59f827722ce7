//! Pending-request table
//!
//! Maps a client name to the one tunnel request currently awaiting that
//! client. Handlers consume entries, permanent forward listeners and the
//! administrative channel register them, all from different tasks; every
//! operation is atomic per key.

use std::net::SocketAddr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpStream;

/// How the broker obtains the external caller's stream for a tunnel
#[derive(Debug)]
pub enum TunnelTarget {
    /// Listen on this broker-side port and take the next accepted
    /// connection (ephemeral, or handed off by a permanent forward)
    ServerPort(u16),

    /// A buffered external caller, already accepted
    Incoming {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
}

/// One awaiting tunnel request
#[derive(Debug)]
pub struct PendingRequest {
    /// Port the client must dial on its own machine
    pub client_port: u16,
    /// Where the external caller comes from
    pub target: TunnelTarget,
}

/// Broker-side registry of awaiting tunnel requests, one slot per client.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: DashMap<String, PendingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request unless the client already has one pending.
    ///
    /// On conflict the rejected request is handed back so the caller can
    /// hold and retry it (it may own a live stream).
    pub fn try_register(
        &self,
        name: &str,
        request: PendingRequest,
    ) -> Result<(), PendingRequest> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(request),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    /// Atomic lookup + remove. Of two concurrent callers racing on the
    /// same name, exactly one gets the request.
    pub fn try_consume(&self, name: &str) -> Option<PendingRequest> {
        self.entries.remove(name).map(|(_, request)| request)
    }

    /// Drop a pending request; returns whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(client_port: u16) -> PendingRequest {
        PendingRequest {
            client_port,
            target: TunnelTarget::ServerPort(9000),
        }
    }

    #[test]
    fn test_register_conflicts_on_occupied_slot() {
        let table = RequestTable::new();
        assert!(table.try_register("alice", request(22)).is_ok());

        let rejected = table.try_register("alice", request(80)).unwrap_err();
        assert_eq!(rejected.client_port, 80);

        // The original entry is untouched.
        let kept = table.try_consume("alice").unwrap();
        assert_eq!(kept.client_port, 22);
    }

    #[test]
    fn test_consume_empties_the_slot() {
        let table = RequestTable::new();
        table.try_register("alice", request(22)).unwrap();

        assert!(table.try_consume("alice").is_some());
        assert!(table.try_consume("alice").is_none());
        assert!(table.try_register("alice", request(23)).is_ok());
    }

    #[test]
    fn test_remove_reports_existence() {
        let table = RequestTable::new();
        table.try_register("alice", request(22)).unwrap();

        assert!(table.remove("alice"));
        assert!(!table.remove("alice"));
        assert!(!table.remove("bob"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_consumers_have_exactly_one_winner() {
        for _ in 0..100 {
            let table = Arc::new(RequestTable::new());
            table.try_register("alice", request(22)).unwrap();

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let table = Arc::clone(&table);
                tasks.push(tokio::spawn(
                    async move { table.try_consume("alice").is_some() },
                ));
            }

            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }
}
