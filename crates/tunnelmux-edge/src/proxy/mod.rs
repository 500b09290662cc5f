//! Transparent proxy: accepts intercepted client connections and turns
//! them into session events.

pub mod listener;
pub mod resolver;

pub use listener::ProxyListener;
pub use resolver::{DestinationResolver, SockNameResolver};
