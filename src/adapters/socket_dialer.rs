use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream, lookup_host};

use crate::{
    adapters::{sockopt::set_mark, udp::DatagramStream},
    core::resolver::IpFamily,
    ports::{BoxedStream, Dialer},
};

/// Default idle timeout of upstream UDP flows
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Udp,
}

fn parse_network(network: &str) -> io::Result<(Protocol, IpFamily)> {
    let protocol = match network {
        "" | "tcp" | "tcp4" | "tcp6" => Protocol::Tcp,
        "udp" | "udp4" | "udp6" => Protocol::Udp,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network '{other}' is not supported by the socket dialer"),
            ));
        }
    };
    Ok((protocol, IpFamily::from_network(network).unwrap_or(IpFamily::Any)))
}

/// Direct TCP and UDP dialer, optionally marking outgoing sockets with `SO_MARK`.
#[derive(Debug, Clone)]
pub struct SocketDialer {
    mark: Option<u32>,
    udp_idle_timeout: Duration,
}

impl Default for SocketDialer {
    fn default() -> Self {
        Self::new(None, DEFAULT_UDP_IDLE_TIMEOUT)
    }
}

impl SocketDialer {
    pub fn new(mark: Option<u32>, udp_idle_timeout: Duration) -> Self {
        Self {
            mark,
            udp_idle_timeout,
        }
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(mark) = self.mark {
            set_mark(&socket, mark)?;
        }
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn connect_addr(&self, protocol: Protocol, addr: SocketAddr) -> io::Result<BoxedStream> {
        Ok(match protocol {
            Protocol::Tcp => Box::new(self.connect_tcp(addr).await?),
            Protocol::Udp => {
                Box::new(DatagramStream::connect(addr, self.mark, self.udp_idle_timeout).await?)
            }
        })
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxedStream> {
        let (protocol, family) = parse_network(network)?;

        let mut last_err = None;
        for addr in lookup_host(address).await? {
            if !family.accepts(&addr.ip()) {
                continue;
            }
            match self.connect_addr(protocol, addr).await {
                Ok(stream) => {
                    tracing::trace!(%addr, ?protocol, mark = ?self.mark, "connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(%addr, ?protocol, "connect failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {network} address found for {address}"),
            )
        }))
    }
}
