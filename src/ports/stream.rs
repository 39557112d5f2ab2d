use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the forwarder can relay over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream handed between dialers, connectors and the relay
pub type BoxedStream = Box<dyn AsyncStream>;
