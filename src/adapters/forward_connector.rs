use std::io;

use async_trait::async_trait;

use crate::ports::{BoxedStream, Connector};

/// Node that relays to a fixed upstream of its own: no handshake, the
/// requested address is only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardConnector;

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(
        &self,
        stream: BoxedStream,
        _network: &str,
        address: &str,
    ) -> io::Result<BoxedStream> {
        tracing::trace!(dst = address, "forward node, passing stream through");
        Ok(stream)
    }

    fn kind(&self) -> &'static str {
        "forward"
    }
}
