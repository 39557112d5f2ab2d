//! hopgate - a programmable traffic forwarder.
//!
//! hopgate accepts intercepted TCP connections (iptables `REDIRECT`, `TPROXY`
//! or a fixed forward target) and forwards them to their destination, either
//! directly or through a chain of proxy hops. Along the way it applies:
//!
//! - address resolution: a static host table first, then a pluggable resolver
//! - bypass rules at the service, hop and node level
//! - admission control by client address and identity
//! - rate, connection-count and traffic limiters scoped globally or per
//!   client, identity or node
//! - per-hop node selection (ordered, round robin, weighted random, health)
//!   with failover to the next node when one fails
//!
//! # Quick Example
//! ```no_run
//! use hopgate::{adapters::TcpTransport, config::load_config, core::build};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("hopgate.yaml").await?;
//! let shutdown = CancellationToken::new();
//! let registries = build(&config, &TcpTransport, &shutdown).await?;
//! for (_, service) in registries.services.get_all() {
//!     tokio::spawn(async move { service.serve().await });
//! }
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (socket based
//! implementations) while keeping the forwarding logic inside `core`. The
//! builder in `core` turns configuration into registries of named
//! components; tests swap the adapters for in-memory streams.
//!
//! # Error Handling
//! The forwarding path returns [`core::ForwardError`]; configuration and
//! startup use `eyre::Result<T>` with context attached.
//!
//! # Concurrency & Data Structures
//! Shared limiter state lives in `scc::HashMap`s and `governor` keyed rate
//! limiters. Host tables are `arc-swap` snapshots replaced on reload.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::TcpTransport,
    core::{ForwardError, Registries, Router, Service, build},
    utils::{ConnectionTracker, GracefulShutdown},
};
