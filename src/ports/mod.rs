//! Ports: the traits the forwarding core talks to the outside world through.
pub mod connector;
pub mod dialer;
pub mod listener;
pub mod stream;

pub use connector::Connector;
pub use dialer::Dialer;
pub use listener::{Accepted, Listener};
pub use stream::{AsyncStream, BoxedStream};
