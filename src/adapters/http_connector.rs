//! HTTP CONNECT handshake over an established stream.
use std::io;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    config::models::AuthConfig,
    ports::{BoxedStream, Connector},
};

/// Upper bound on the proxy's response header
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

#[derive(Clone, Default)]
pub struct HttpConnector {
    /// Precomputed `Proxy-Authorization` value
    authorization: Option<String>,
}

impl HttpConnector {
    pub fn new(auth: Option<&AuthConfig>) -> Self {
        Self {
            authorization: auth.map(|auth| {
                format!(
                    "Basic {}",
                    STANDARD.encode(format!("{}:{}", auth.username, auth.password))
                )
            }),
        }
    }

    fn request(&self, address: &str) -> String {
        let mut request = format!(
            "CONNECT {address} HTTP/1.1\r\nHost: {address}\r\nUser-Agent: hopgate/{}\r\nProxy-Connection: keep-alive\r\n",
            env!("CARGO_PKG_VERSION")
        );
        if let Some(authorization) = &self.authorization {
            request.push_str("Proxy-Authorization: ");
            request.push_str(authorization);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request
    }
}

impl std::fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnector")
            .field("auth", &self.authorization.is_some())
            .finish()
    }
}

/// Read up to and including the blank line ending the response header.
///
/// Reads one byte at a time so nothing the upstream sends after the header
/// is consumed here.
async fn read_response_header(stream: &mut BoxedStream) -> io::Result<String> {
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_RESPONSE_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy response header too large",
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        header.push(byte[0]);
    }
    String::from_utf8(header)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "proxy response is not UTF-8"))
}

fn parse_status(header: &str) -> io::Result<(u16, &str)> {
    let status_line = header.lines().next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed proxy status line '{status_line}'"),
        ));
    }
    let code = code.parse::<u16>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed proxy status line '{status_line}'"),
        )
    })?;
    Ok((code, parts.next().unwrap_or_default()))
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        mut stream: BoxedStream,
        network: &str,
        address: &str,
    ) -> io::Result<BoxedStream> {
        if !matches!(network, "" | "tcp" | "tcp4" | "tcp6") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("HTTP CONNECT cannot carry network '{network}'"),
            ));
        }

        stream.write_all(self.request(address).as_bytes()).await?;
        stream.flush().await?;

        let header = read_response_header(&mut stream).await?;
        let (code, reason) = parse_status(&header)?;
        tracing::trace!(dst = address, code, "CONNECT response");

        match code {
            200 => Ok(stream),
            407 => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("proxy authentication required for {address}"),
            )),
            _ => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused CONNECT {address}: {code} {reason}"),
            )),
        }
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}
