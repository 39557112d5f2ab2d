//! TCP listeners for each way of learning a connection's destination.
use std::{io, net::SocketAddr};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};

use crate::{
    adapters::sockopt::{original_dst_of, set_transparent},
    config::models::{ListenerKind, ServiceConfig},
    core::addr::{join_host_port, split_host_port},
    ports::{Accepted, Listener},
};

const BACKLOG: u32 = 1024;

/// TCP listener that derives the destination according to its [`ListenerKind`].
#[derive(Debug)]
pub struct TcpServiceListener {
    listener: TcpListener,
    kind: ListenerKind,
    target: Option<String>,
}

impl TcpServiceListener {
    /// Bind the listener described by `service`.
    pub async fn bind(service: &ServiceConfig) -> Result<Self> {
        let addr = listen_addr(&service.addr, &service.network).await?;

        let listener = match service.listener.kind {
            ListenerKind::Tproxy => bind_transparent(addr)
                .wrap_err_with(|| format!("Failed to bind transparent listener on {addr}"))?,
            ListenerKind::Redirect | ListenerKind::Forward => TcpListener::bind(addr)
                .await
                .wrap_err_with(|| format!("Failed to bind {addr}"))?,
        };

        Ok(Self {
            listener,
            kind: service.listener.kind,
            target: service.listener.target.clone(),
        })
    }

    fn destination(&self, stream: &TcpStream) -> io::Result<String> {
        match self.kind {
            ListenerKind::Redirect => Ok(original_dst_of(stream)?.to_string()),
            // TPROXY keeps the original destination as the local address
            ListenerKind::Tproxy => Ok(stream.local_addr()?.to_string()),
            ListenerKind::Forward => self.target.clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "forward listener without target")
            }),
        }
    }
}

pub(crate) async fn listen_addr(addr: &str, network: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(addr)?;
    let host = match (host, network) {
        ("", "tcp6" | "udp6") => "::",
        ("", _) => "0.0.0.0",
        (host, _) => host,
    };
    // an empty port asks for an ephemeral one
    let port = if port.is_empty() { "0" } else { port };
    lookup_host(join_host_port(host, port))
        .await
        .wrap_err_with(|| format!("Failed to resolve listen address {addr}"))?
        .next()
        .ok_or_else(|| eyre!("No address found for {addr}"))
}

fn bind_transparent(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    set_transparent(&socket, addr.is_ipv6())?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

#[async_trait]
impl Listener for TcpServiceListener {
    async fn accept(&self) -> io::Result<Accepted> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            match self.destination(&stream) {
                Ok(destination) => {
                    stream.set_nodelay(true)?;
                    return Ok(Accepted {
                        stream: Box::new(stream),
                        peer,
                        destination,
                    });
                }
                // a single connection without a destination is dropped, not fatal
                Err(e) => tracing::warn!(%peer, kind = ?self.kind, "no destination for connection: {e}"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn forward_listener_reports_target() {
        let mut service = ServiceConfig::new("fwd", "127.0.0.1:0");
        service.listener.kind = ListenerKind::Forward;
        service.listener.target = Some("example.com:443".into());
        let listener = TcpServiceListener::bind(&service).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.destination, "example.com:443");
        assert_eq!(accepted.peer, client.local_addr().unwrap());

        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn listen_addr_defaults_empty_host() {
        let addr = listen_addr(":8080", "tcp").await.unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse().unwrap());
        let addr = listen_addr("[::1]:8080", "tcp").await.unwrap();
        assert_eq!(addr, "[::1]:8080".parse().unwrap());
        assert!(listen_addr("8080", "tcp").await.is_err());

        let addr = listen_addr("127.0.0.1:", "tcp").await.unwrap();
        assert_eq!(addr.port(), 0);
        let addr = listen_addr(":", "udp6").await.unwrap();
        assert_eq!(addr.to_string(), "[::]:0");
    }
}
