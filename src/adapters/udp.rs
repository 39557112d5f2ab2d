//! UDP redirect: datagram flows carried as streams.
//!
//! The listener receives TPROXY-intercepted datagrams on one socket and
//! demultiplexes them into sessions keyed by (client, original destination).
//! Each new session is handed to the service like an accepted TCP
//! connection; reads yield one datagram and writes send one back to the
//! client from the original destination address. Upstream flows are
//! connected UDP sockets behind the same stream interface. Both sides report
//! EOF once no datagram arrived for the idle timeout, which is how the relay
//! of a session ends.
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context as _, Result};
use scc::HashMap as SccHashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
    sync::{Mutex, mpsc, mpsc::error::TrySendError},
    time::{Instant, Sleep},
};

use crate::{
    adapters::sockopt::{bind_transparent_udp, recv_original_dst, recv_with_original_dst, set_mark},
    ports::{Accepted, Listener},
};

/// Largest datagram read from the wire
const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagrams queued per session before new ones are dropped
const SESSION_BACKLOG: usize = 64;

/// Deadline pushed back every time traffic is seen.
struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn touch(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.sleep.as_mut().poll(cx).is_ready()
    }
}

/// Connected UDP socket as a stream.
pub struct DatagramStream {
    socket: UdpSocket,
    idle: IdleTimer,
}

impl DatagramStream {
    fn new(socket: UdpSocket, idle_timeout: Duration) -> Self {
        Self {
            socket,
            idle: IdleTimer::new(idle_timeout),
        }
    }

    /// Connect a fresh socket of the right family to `addr`.
    pub async fn connect(
        addr: SocketAddr,
        mark: Option<u32>,
        idle_timeout: Duration,
    ) -> io::Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        if let Some(mark) = mark {
            set_mark(&socket, mark)?;
        }
        socket.connect(addr).await?;
        Ok(Self::new(socket, idle_timeout))
    }
}

impl AsyncRead for DatagramStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.socket.poll_recv(cx, buf) {
            Poll::Ready(result) => {
                this.idle.touch();
                Poll::Ready(result)
            }
            // an expired timer reads as EOF
            Poll::Pending if this.idle.poll_expired(cx) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for DatagramStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

type SessionKey = (SocketAddr, SocketAddr);
type Sessions = Arc<SccHashMap<SessionKey, mpsc::Sender<Vec<u8>>>>;

/// One client flow accepted by [`UdpRedirectListener`].
pub struct UdpSession {
    key: SessionKey,
    rx: mpsc::Receiver<Vec<u8>>,
    /// Bound to the original destination so replies carry its address
    reply: UdpSocket,
    sessions: Sessions,
    idle: IdleTimer,
}

impl AsyncRead for UdpSession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                this.idle.touch();
                let n = datagram.len().min(buf.remaining());
                if n < datagram.len() {
                    tracing::trace!(len = datagram.len(), kept = n, "datagram truncated");
                }
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending if this.idle.poll_expired(cx) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let client = self.key.0;
        self.reply.poll_send_to(cx, buf, client)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.rx.close();
        // a newer session under the same key has an open sender and stays
        self.sessions.remove_if_sync(&self.key, |tx| tx.is_closed());
    }
}

/// TPROXY UDP listener splitting datagrams into per-flow sessions.
pub struct UdpRedirectListener {
    socket: UdpSocket,
    sessions: Sessions,
    idle_timeout: Duration,
    buf: Mutex<Vec<u8>>,
}

impl UdpRedirectListener {
    /// Bind a transparent socket on `addr` that reports original destinations.
    pub fn bind(addr: SocketAddr, idle_timeout: Duration) -> Result<Self> {
        let socket = bind_transparent_udp(addr, true).wrap_err_with(|| {
            format!("Failed to bind transparent UDP socket on {addr} (needs CAP_NET_ADMIN)")
        })?;
        recv_original_dst(&socket, addr.is_ipv6())
            .wrap_err_with(|| format!("Failed to enable original destinations on {addr}"))?;
        Ok(Self {
            socket,
            sessions: Arc::new(SccHashMap::new()),
            idle_timeout,
            buf: Mutex::new(vec![0u8; MAX_DATAGRAM]),
        })
    }

    /// Queue `datagram` on the live session for `key`.
    ///
    /// Hands the datagram back when no session is open.
    fn deliver(&self, key: &SessionKey, datagram: Vec<u8>) -> Option<Vec<u8>> {
        let Some(tx) = self.sessions.read_sync(key, |_, tx| tx.clone()) else {
            return Some(datagram);
        };
        match tx.try_send(datagram) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(client = %key.0, dst = %key.1, "session backlog full, dropped");
                None
            }
            Err(TrySendError::Closed(datagram)) => Some(datagram),
        }
    }

    fn open_session(&self, key: SessionKey, first: Vec<u8>) -> io::Result<UdpSession> {
        let reply = bind_transparent_udp(key.1, true)?;
        let (tx, rx) = mpsc::channel(SESSION_BACKLOG);
        // capacity is positive, so the first datagram always fits
        let _ = tx.try_send(first);
        self.sessions.upsert_sync(key, tx);
        Ok(UdpSession {
            key,
            rx,
            reply,
            sessions: self.sessions.clone(),
            idle: IdleTimer::new(self.idle_timeout),
        })
    }
}

#[async_trait]
impl Listener for UdpRedirectListener {
    async fn accept(&self) -> io::Result<Accepted> {
        let mut buf = self.buf.lock().await;
        loop {
            let received = recv_with_original_dst(&self.socket, &mut buf).await?;
            let Some(dst) = received.original_dst else {
                tracing::warn!(peer = %received.peer, "datagram without original destination");
                continue;
            };

            let key = (received.peer, dst);
            let datagram = buf[..received.len].to_vec();
            let Some(datagram) = self.deliver(&key, datagram) else {
                continue;
            };

            match self.open_session(key, datagram) {
                Ok(session) => {
                    return Ok(Accepted {
                        stream: Box::new(session),
                        peer: received.peer,
                        destination: dst.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(peer = %received.peer, %dst, "cannot open UDP session: {e}")
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn datagram_stream_keeps_message_boundaries() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut stream = DatagramStream::connect(addr, None, Duration::from_secs(5))
            .await
            .unwrap();

        stream.write_all(b"one").await.unwrap();
        stream.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");

        server.send_to(b"reply", from).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn idle_datagram_stream_reads_eof() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut stream = DatagramStream::connect(addr, None, Duration::from_millis(50))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn dropped_session_unregisters_only_itself() {
        let sessions: Sessions = Arc::new(SccHashMap::new());
        let key: SessionKey = ("127.0.0.1:40000".parse().unwrap(), "127.0.0.1:53".parse().unwrap());
        let reply = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (old_tx, old_rx) = mpsc::channel(1);
        sessions.upsert_sync(key, old_tx);
        let old = UdpSession {
            key,
            rx: old_rx,
            reply,
            sessions: sessions.clone(),
            idle: IdleTimer::new(Duration::from_secs(5)),
        };
        drop(old);
        assert_eq!(sessions.len(), 0);

        // a replacement registered under the same key survives a stale drop
        let (new_tx, _new_rx) = mpsc::channel::<Vec<u8>>(1);
        sessions.upsert_sync(key, new_tx);
        let (_, stale_rx) = mpsc::channel::<Vec<u8>>(1);
        let stale = UdpSession {
            key,
            rx: stale_rx,
            reply: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            sessions: sessions.clone(),
            idle: IdleTimer::new(Duration::from_secs(5)),
        };
        drop(stale);
        assert_eq!(sessions.len(), 1);
    }
}
