use std::io;

use async_trait::async_trait;

use super::stream::BoxedStream;

/// Opens the first transport connection of a route.
///
/// With an empty chain this connects straight to the destination; otherwise
/// it connects to the first node and the node connectors take it from there.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `address` (`host:port`) over `network` (`tcp`, `tcp4`, `tcp6`).
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream>;
}
