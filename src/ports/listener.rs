use std::{io, net::SocketAddr};

use async_trait::async_trait;

use super::stream::BoxedStream;

/// An accepted inbound connection and where it was headed.
pub struct Accepted {
    pub stream: BoxedStream,
    pub peer: SocketAddr,
    /// Destination the client asked for (`host:port`)
    pub destination: String,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("peer", &self.peer)
            .field("destination", &self.destination)
            .finish()
    }
}

/// Source of inbound connections for a service.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<Accepted>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}
