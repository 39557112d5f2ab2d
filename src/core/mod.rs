pub mod addr;
pub mod admission;
pub mod builder;
pub mod bypass;
pub mod cancel;
pub mod chain;
pub mod error;
pub mod hop;
pub mod hosts;
pub mod limiter;
pub mod matcher;
pub mod node;
pub mod registry;
pub mod resolve;
pub mod resolver;
pub mod router;
pub mod selector;
pub mod service;

pub use builder::{TransportFactory, build, reload_hosts, spawn_limiter_maintenance};
pub use chain::{Chain, Route};
pub use error::{ForwardError, ForwardResult, ResolveError};
pub use hop::Hop;
pub use node::Node;
pub use registry::{Registries, Registry};
pub use resolve::resolve;
pub use router::{DialRequest, Router, Tunnel};
pub use service::Service;
