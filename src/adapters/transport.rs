use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Context, Result};

use crate::{
    adapters::{
        forward_connector::ForwardConnector,
        http_connector::HttpConnector,
        listeners::{TcpServiceListener, listen_addr},
        socket_dialer::SocketDialer,
        udp::UdpRedirectListener,
    },
    config::models::{ConnectorKind, DialerConfig, NodeConfig, ServiceConfig},
    core::builder::TransportFactory,
    ports::{Connector, Dialer, Listener},
};

fn udp_idle_timeout(config: &DialerConfig) -> Result<Duration> {
    humantime::parse_duration(&config.udp_idle_timeout)
        .wrap_err_with(|| format!("Invalid UDP idle timeout '{}'", config.udp_idle_timeout))
}

/// Real sockets: direct dialers, HTTP/forward connectors, TCP listeners and
/// TPROXY UDP listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl TransportFactory for TcpTransport {
    fn dialer(&self, config: &DialerConfig) -> Result<Arc<dyn Dialer>> {
        Ok(Arc::new(SocketDialer::new(config.mark, udp_idle_timeout(config)?)))
    }

    fn connector(&self, node: &NodeConfig) -> Result<Arc<dyn Connector>> {
        Ok(match node.connector.kind {
            ConnectorKind::Http => Arc::new(HttpConnector::new(node.connector.auth.as_ref())),
            ConnectorKind::Forward => Arc::new(ForwardConnector),
        })
    }

    async fn listen(&self, service: &ServiceConfig) -> Result<Arc<dyn Listener>> {
        if service.network.starts_with("udp") {
            let addr = listen_addr(&service.addr, &service.network).await?;
            let idle = udp_idle_timeout(&service.dialer)?;
            return Ok(Arc::new(UdpRedirectListener::bind(addr, idle)?));
        }
        Ok(Arc::new(TcpServiceListener::bind(service).await?))
    }
}
