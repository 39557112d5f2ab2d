use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::Result;
use tokio::{signal, sync::broadcast};
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Force shutdown (drain timeout exceeded)
    Force,
}

/// Manages graceful shutdown and reload signals.
///
/// Shutdown is broadcast through a [`CancellationToken`] that background
/// tasks watch. Connections are not tied to it; the caller drains them for
/// [`GracefulShutdown::drain_timeout`] once the token fires. SIGHUP does not
/// stop anything; it is delivered to [`GracefulShutdown::subscribe_reload`]
/// receivers.
pub struct GracefulShutdown {
    token: CancellationToken,
    reload_tx: broadcast::Sender<()>,
    shutdown_initiated: Arc<AtomicBool>,
    /// Maximum time to wait for connections to drain
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (reload_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reload_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// Root token cancelled on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn subscribe_reload(&self) -> broadcast::Receiver<()> {
        self.reload_tx.subscribe()
    }

    /// Manually trigger shutdown (first caller wins)
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!("Processing shutdown signal: {:?}", reason);
            self.token.cancel();
        } else {
            tracing::warn!("Shutdown already initiated, ignoring signal");
        }
    }

    /// Listen for OS signals until shutdown is requested.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!(
            "Signal handler started. Listening for SIGTERM, SIGINT (graceful shutdown) and SIGHUP (reload)"
        );
        let mut hangups = HangupStream::new()?;
        let mut terminate = TerminateStream::new()?;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = signal::ctrl_c() => {
                    tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    self.trigger_shutdown(ShutdownReason::Graceful);
                    break;
                }
                _ = terminate.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    self.trigger_shutdown(ShutdownReason::Graceful);
                    break;
                }
                _ = hangups.recv() => {
                    tracing::info!("Received SIGHUP, reloading");
                    let _ = self.reload_tx.send(());
                }
            }
        }

        tracing::info!("Signal handler shutting down");
        Ok(())
    }

    /// Wait until shutdown is triggered.
    pub async fn wait_for_shutdown_signal(&self) {
        self.token.cancelled().await;
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
struct TerminateStream(signal::unix::Signal);

#[cfg(unix)]
impl TerminateStream {
    fn new() -> Result<Self> {
        use signal::unix::{SignalKind, signal};
        Ok(Self(signal(SignalKind::terminate())?))
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

#[cfg(not(unix))]
struct TerminateStream;

#[cfg(not(unix))]
impl TerminateStream {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
struct HangupStream(signal::unix::Signal);

#[cfg(unix)]
impl HangupStream {
    fn new() -> Result<Self> {
        use signal::unix::{SignalKind, signal};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

#[cfg(not(unix))]
struct HangupStream;

#[cfg(not(unix))]
impl HangupStream {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
