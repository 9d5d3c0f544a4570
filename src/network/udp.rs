//! UDP socket construction
//!
//! All sockets are built with `socket2` so reuse, broadcast and timeouts are
//! set before binding, then handed out as `std::net::UdpSocket`.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Create and bind a UDP socket
pub fn create_socket(addr: SocketAddr, reuse_address: bool) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    if reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::SocketOption(format!("SO_REUSEADDR: {}", e)))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    Ok(socket.into())
}

/// Listening socket for announcements, with a read timeout so the receive
/// loop can observe shutdown
pub fn bind_discovery_socket(
    addr: SocketAddr,
    read_timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    let socket = create_socket(addr, true)?;
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| NetworkError::SocketOption(format!("read timeout: {}", e)))?;
    tracing::debug!("Discovery socket bound to {:?}", socket.local_addr().ok());
    Ok(socket)
}

/// Unbound-port sender for announcements
pub fn create_announce_socket(broadcast: bool) -> Result<UdpSocket, NetworkError> {
    let socket = create_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), false)?;
    if broadcast {
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::SocketOption(format!("SO_BROADCAST: {}", e)))?;
    }
    Ok(socket)
}

/// Bind the first free port in `start..=end`
pub fn bind_port_in_range(
    ip: IpAddr,
    start: u16,
    end: u16,
    read_timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    for port in start..=end {
        if let Ok(socket) = create_socket(SocketAddr::new(ip, port), false) {
            socket
                .set_read_timeout(Some(read_timeout))
                .map_err(|e| NetworkError::SocketOption(format!("read timeout: {}", e)))?;
            return Ok(socket);
        }
    }
    Err(NetworkError::NoFreePort { start, end })
}

/// Non-blocking socket on an OS-assigned port
pub fn bind_ephemeral(ip: IpAddr) -> Result<UdpSocket, NetworkError> {
    let socket = create_socket(SocketAddr::new(ip, 0), false)?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::SocketOption(format!("non-blocking: {}", e)))?;
    Ok(socket)
}

/// Send one datagram, mapping failures to [`NetworkError::SendFailed`]
pub fn send_to(socket: &UdpSocket, data: &[u8], target: SocketAddr) -> Result<(), NetworkError> {
    match socket.send_to(data, target) {
        Ok(n) if n == data.len() => Ok(()),
        Ok(n) => Err(NetworkError::SendFailed(format!(
            "short send to {}: {} of {} bytes",
            target,
            n,
            data.len()
        ))),
        Err(e) => Err(NetworkError::SendFailed(format!("{}: {}", target, e))),
    }
}

/// True for errors a timed or non-blocking receive reports when idle
pub fn is_idle_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_skips_taken_ports() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = bind_ephemeral(localhost).unwrap();
        let taken = first.local_addr().unwrap().port();

        let socket =
            bind_port_in_range(localhost, taken, taken.saturating_add(50), Duration::from_millis(10))
                .unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), taken);
    }

    #[test]
    fn test_send_and_idle_receive() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let receiver =
            bind_discovery_socket(SocketAddr::new(localhost, 0), Duration::from_millis(20)).unwrap();
        let sender = create_announce_socket(false).unwrap();

        let mut buf = [0u8; 16];
        let err = receiver.recv_from(&mut buf).unwrap_err();
        assert!(is_idle_error(&err));

        let target = SocketAddr::new(localhost, receiver.local_addr().unwrap().port());
        send_to(&sender, b"hello", target).unwrap();
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
