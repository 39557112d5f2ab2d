// Shared in-memory transport for the integration tests
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use hopgate::{
    config::models::{DialerConfig, NodeConfig, ServiceConfig},
    core::TransportFactory,
    ports::{Accepted, BoxedStream, Connector, Dialer, Listener},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, duplex},
    sync::{Notify, mpsc},
};

/// Ordered record of every dial and connect performed.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// The near end of a duplex pair whose far end echoes everything back.
pub fn echo_stream() -> BoxedStream {
    let (near, mut far) = duplex(4096);
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok(n) = far.read(&mut buf).await {
            if n == 0 || far.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    Box::new(near)
}

/// Dials echo streams, refusing the configured addresses.
pub struct StubDialer {
    pub journal: Journal,
    pub refuse: HashSet<String>,
}

impl StubDialer {
    pub fn new(journal: &Journal, refuse: &[&str]) -> Self {
        Self {
            journal: journal.clone(),
            refuse: refuse.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Dialer for StubDialer {
    async fn dial(&self, _network: &str, address: &str) -> io::Result<BoxedStream> {
        self.journal.push(format!("dial {address}"));
        if self.refuse.contains(address) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(echo_stream())
    }
}

/// Passes the stream through, refusing the configured addresses.
pub struct StubConnector {
    pub name: String,
    pub journal: Journal,
    pub refuse: HashSet<String>,
}

impl StubConnector {
    pub fn new(name: &str, journal: &Journal, refuse: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            refuse: refuse.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(
        &self,
        stream: BoxedStream,
        _network: &str,
        address: &str,
    ) -> io::Result<BoxedStream> {
        self.journal.push(format!("{} -> {address}", self.name));
        if self.refuse.contains(address) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(stream)
    }

    fn kind(&self) -> &'static str {
        "stub"
    }
}

/// Connector whose handshake never completes; `started` fires once it is entered.
pub struct StallingConnector {
    pub journal: Journal,
    pub started: Arc<Notify>,
}

#[async_trait]
impl Connector for StallingConnector {
    async fn connect(
        &self,
        _stream: BoxedStream,
        _network: &str,
        address: &str,
    ) -> io::Result<BoxedStream> {
        self.journal.push(format!("stall -> {address}"));
        self.started.notify_one();
        std::future::pending().await
    }

    fn kind(&self) -> &'static str {
        "stall"
    }
}

/// Listener fed by the test through a channel.
pub struct ChannelListener {
    rx: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&self) -> io::Result<Accepted> {
        match self.rx.lock().await.recv().await {
            Some(accepted) => Ok(accepted),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:1".parse().unwrap())
    }
}

/// Transport whose services accept from channels and dial echo streams.
#[derive(Default)]
pub struct StubTransport {
    pub journal: Journal,
    pub refuse: Vec<String>,
    senders: Mutex<HashMap<String, mpsc::Sender<Accepted>>>,
}

impl StubTransport {
    pub fn refusing(refuse: &[&str]) -> Self {
        Self {
            refuse: refuse.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Sender feeding the listener of `service`
    pub fn sender(&self, service: &str) -> mpsc::Sender<Accepted> {
        self.senders.lock().unwrap()[service].clone()
    }

    fn refused(&self) -> Vec<&str> {
        self.refuse.iter().map(String::as_str).collect()
    }
}

#[async_trait]
impl TransportFactory for StubTransport {
    fn dialer(&self, _config: &DialerConfig) -> eyre::Result<Arc<dyn Dialer>> {
        Ok(Arc::new(StubDialer::new(&self.journal, &self.refused())))
    }

    fn connector(&self, node: &NodeConfig) -> eyre::Result<Arc<dyn Connector>> {
        Ok(Arc::new(StubConnector::new(
            &node.name,
            &self.journal,
            &self.refused(),
        )))
    }

    async fn listen(&self, service: &ServiceConfig) -> eyre::Result<Arc<dyn Listener>> {
        let (tx, rx) = mpsc::channel(8);
        self.senders
            .lock()
            .unwrap()
            .insert(service.name.clone(), tx);
        Ok(Arc::new(ChannelListener {
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}
