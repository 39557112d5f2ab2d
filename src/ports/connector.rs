use std::io;

use async_trait::async_trait;

use super::stream::BoxedStream;

/// Per-node handshake: ask the proxy at the other end of `stream` to open a
/// stream to `address`, returning the stream that now reaches it.
///
/// Implementations own the protocol of one node kind (HTTP CONNECT, plain
/// forward). They never dial on their own.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        stream: BoxedStream,
        network: &str,
        address: &str,
    ) -> io::Result<BoxedStream>;

    /// Protocol label for logs
    fn kind(&self) -> &'static str;

    /// Whether connections on `network` can be carried through this node.
    fn supports(&self, network: &str) -> bool {
        matches!(network, "" | "tcp" | "tcp4" | "tcp6")
    }
}
