pub mod connection_tracker;
pub mod graceful_shutdown;
pub mod relay;
pub mod supervisor;

pub use connection_tracker::{ConnectionInfo, ConnectionTracker};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
pub use relay::{RelayStats, relay};
pub use supervisor::{split_worker_args, supervise};
