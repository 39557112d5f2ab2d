//! A listening service: accept loop plus one task per inbound connection.
use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    core::router::{DialRequest, Router},
    metrics::ConnectionTimer,
    ports::{Accepted, Listener},
    tracing_setup::connection_span,
    utils::ConnectionTracker,
};

const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

pub struct Service {
    name: Arc<str>,
    network: Arc<str>,
    listener: Arc<dyn Listener>,
    router: Arc<Router>,
    tracker: ConnectionTracker,
    /// Cancels in-flight connections (and accepting)
    conn_token: CancellationToken,
    /// Cancels accepting only
    accept_token: CancellationToken,
}

impl Service {
    /// `parent` is the process shutdown token; cancelling it closes the service.
    pub fn new(
        name: &str,
        network: &str,
        listener: Arc<dyn Listener>,
        router: Arc<Router>,
        parent: &CancellationToken,
    ) -> Self {
        let conn_token = parent.child_token();
        let accept_token = conn_token.child_token();
        Self {
            name: Arc::from(name),
            network: Arc::from(network),
            listener,
            router,
            tracker: ConnectionTracker::new(),
            conn_token,
            accept_token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until the service is closed.
    pub async fn serve(&self) -> std::io::Result<()> {
        let local = self.listener.local_addr()?;
        tracing::info!(service = %self.name, %local, "service listening");

        let mut backoff = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.accept_token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok(accepted) => {
                    backoff = Duration::ZERO;
                    self.spawn_connection(accepted);
                }
                Err(e) => {
                    backoff = if backoff.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (backoff * 2).min(MAX_ACCEPT_BACKOFF)
                    };
                    tracing::warn!(service = %self.name, "accept failed: {e}; retrying in {backoff:?}");
                    tokio::select! {
                        _ = self.accept_token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        tracing::info!(service = %self.name, "service stopped accepting");
        Ok(())
    }

    fn spawn_connection(&self, accepted: Accepted) {
        let name = self.name.clone();
        let network = self.network.clone();
        let router = self.router.clone();
        let tracker = self.tracker.clone();
        let cancel = self.conn_token.child_token();
        let span = connection_span(&name, accepted.peer, &accepted.destination);

        tokio::spawn(async move {
            let _timer = ConnectionTimer::new(&name);
            let Accepted {
                stream,
                peer,
                destination,
            } = accepted;
            let info = tracker.register(&name, peer, &destination).await;
            tracing::debug!(service = %name, %peer, dst = %destination, "connection accepted");

            let request = DialRequest::new(&network, &destination).with_client(peer);
            // the router logs dial failures itself
            if let Ok(tunnel) = router.dial(&request, &cancel).await {
                match tunnel.relay(stream, &cancel).await {
                    Ok(stats) => info.add_bytes(stats.input, stats.output),
                    Err(e) => {
                        tracing::debug!(service = %name, %peer, dst = %destination, "relay ended: {e}")
                    }
                }
            }

            tracker.unregister(info.id).await;
        }
        .instrument(span));
    }

    /// Stop accepting; established connections keep running.
    pub fn stop_accepting(&self) {
        self.accept_token.cancel();
    }

    /// Stop accepting and cancel every in-flight connection.
    pub fn close(&self) {
        self.conn_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.conn_token.is_cancelled()
    }

    /// Wait for tracked connections to finish; `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.wait_for_drain(timeout).await
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("network", &self.network)
            .field("active", &self.tracker.active_connection_count())
            .finish()
    }
}
