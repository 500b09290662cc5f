//! Original-destination lookup for intercepted connections.

use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::TcpStream;
use tunnelmux_core::{TunnelError, TunnelResult};

/// Recovers the address a client was actually trying to reach.
pub trait DestinationResolver: Send + Sync {
    fn original_destination(&self, stream: &TcpStream) -> TunnelResult<SocketAddrV4>;
}

/// Reads the destination from the accepted socket's local address.
///
/// Correct for connections diverted to an `IP_TRANSPARENT` listener, where
/// the kernel keeps the original destination as the socket's local end.
/// Only IPv4 destinations are supported; IPv4-mapped IPv6 addresses are
/// unwrapped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SockNameResolver;

impl DestinationResolver for SockNameResolver {
    fn original_destination(&self, stream: &TcpStream) -> TunnelResult<SocketAddrV4> {
        let local = stream
            .local_addr()
            .map_err(|e| TunnelError::Destination(format!("getsockname failed: {e}")))?;
        to_ipv4(local)
    }
}

fn to_ipv4(addr: SocketAddr) -> TunnelResult<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port()))
            .ok_or_else(|| TunnelError::Destination(format!("{v6} is not an IPv4 address"))),
    }
}
