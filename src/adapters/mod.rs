pub mod forward_connector;
pub mod http_connector;
pub mod listeners;
pub mod socket_dialer;
pub mod sockopt;
pub mod transport;
pub mod udp;

/// Re-export commonly used types from adapters
pub use forward_connector::ForwardConnector;
pub use http_connector::HttpConnector;
pub use listeners::TcpServiceListener;
pub use socket_dialer::SocketDialer;
pub use transport::TcpTransport;
pub use udp::UdpRedirectListener;
