//! Socket construction for listeners and client endpoints.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Pending-connection queue length for the TCP listener.
const LISTEN_BACKLOG: i32 = 1024;

fn domain_for(addr: SocketAddr) -> socket2::Domain {
    match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    }
}

/// Resolve `host:port` to the first IPv4 address, falling back to any.
pub fn resolve(addr: &str) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address found for {addr}"),
            )
        })
}

/// Whether a failed `accept` or `recv_from` affects only one peer, so the
/// caller can keep draining the socket.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
    )
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR` set.
pub fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        domain_for(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Create a non-blocking UDP socket bound to `addr`.
pub fn bind_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        domain_for(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Create a non-blocking UDP socket connected to `peer` from an ephemeral port.
pub fn connect_udp(peer: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let socket = bind_udp(local)?;
    socket.connect(peer)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_ipv4() {
        let addr = resolve("127.0.0.1:4242").unwrap();
        assert_eq!(addr, "127.0.0.1:4242".parse().unwrap());
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve("not an address").is_err());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_transient(&io::ErrorKind::ConnectionReset.into()));
        assert!(is_transient(&io::ErrorKind::Interrupted.into()));
        // Resource exhaustion keeps failing until something is released
        assert!(!is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::ErrorKind::OutOfMemory.into()));
    }

    #[test]
    fn test_listener_binds_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
