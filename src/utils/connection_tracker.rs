//! Connection tracking & graceful draining utilities.
//!
//! Every forwarded connection is registered with a lightweight record keeping
//! its peer, destination, age and relayed byte counts. During shutdown the
//! tracker waits for in-flight connections to finish, bounded by a timeout.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio::time::sleep;

/// Unique identifier for a connection
pub type ConnectionId = u64;

/// Information about an active forwarded connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub service: String,
    pub peer: SocketAddr,
    pub destination: String,
    pub established_at: Instant,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, service: &str, peer: SocketAddr, destination: &str) -> Self {
        Self {
            id,
            service: service.to_string(),
            peer,
            destination: destination.to_string(),
            established_at: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn add_bytes(&self, input: u64, output: u64) {
        self.bytes_in.fetch_add(input, Ordering::Relaxed);
        self.bytes_out.fetch_add(output, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

/// Registry of in-flight connections, shared by a service and its tasks
#[derive(Clone)]
pub struct ConnectionTracker {
    connections: Arc<HashMap<ConnectionId, Arc<ConnectionInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self {
            connections: Arc::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new connection and return an Arc to its info record.
    pub async fn register(&self, service: &str, peer: SocketAddr, destination: &str) -> Arc<ConnectionInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ConnectionInfo::new(id, service, peer, destination));

        let _ = self.connections.insert_async(id, info.clone()).await;

        tracing::debug!(
            "Connection registered: id={}, peer={}, dst={}, total_connections={}",
            id,
            peer,
            destination,
            self.connections.len()
        );

        info
    }

    /// Remove (unregister) a connection by id.
    pub async fn unregister(&self, connection_id: ConnectionId) {
        if let Some((_, info)) = self.connections.remove_async(&connection_id).await {
            let (input, output) = info.bytes();
            tracing::debug!(
                "Connection unregistered: id={}, age={:?}, in={}, out={}, total_connections={}",
                connection_id,
                info.age(),
                input,
                output,
                self.connections.len()
            );
        }
    }

    /// Current number of registered connections.
    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wait until no connection is registered or the timeout elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            if self.connections.is_empty() {
                tracing::info!("All connections drained successfully");
                return true;
            }

            tracing::debug!(
                "Waiting for connections to drain: {} remaining, elapsed: {:?}",
                self.connections.len(),
                start.elapsed()
            );

            sleep(check_interval).await;

            // Exponential backoff up to 1 second
            check_interval = std::cmp::min(check_interval * 2, Duration::from_secs(1));
        }

        if self.connections.is_empty() {
            return true;
        }
        tracing::warn!(
            "Drain timeout exceeded: {} connections still open after {:?}",
            self.connections.len(),
            timeout
        );
        false
    }

}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
