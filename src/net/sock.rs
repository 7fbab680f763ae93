//! Socket construction: listening TCP, outgoing TCP with interface
//! binding and a connect deadline, and the UDP sockets discovery needs
//! (reusable receive socket joined to every multicast group on every
//! usable interface, plus broadcast/multicast senders).

use crate::errors::{EtError, Result};
use crate::net::iface;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Open the server listening socket.
pub async fn tcp_listen(
    port: u16,
    send_buf: usize,
    recv_buf: usize,
) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4().map_err(|_| EtError::Socket)?;
    socket.set_reuseaddr(true).map_err(|_| EtError::Socket)?;
    if send_buf > 0 {
        socket.set_send_buffer_size(send_buf as u32).map_err(|_| EtError::Socket)?;
    }
    if recv_buf > 0 {
        socket.set_recv_buffer_size(recv_buf as u32).map_err(|_| EtError::Socket)?;
    }
    socket
        .bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
        .map_err(|_| EtError::Socket)?;
    socket.listen(64).map_err(|_| EtError::Socket)
}

/// Connect to `addr`, optionally binding the local end to a specific
/// interface address first, with an optional overall deadline.
/// `Err(Timeout)` is distinct from connection refusal (`Network`).
pub async fn tcp_connect(
    addr: SocketAddr,
    interface: Option<Ipv4Addr>,
    nodelay: bool,
    send_buf: usize,
    recv_buf: usize,
    deadline: Option<Duration>,
) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4().map_err(|_| EtError::Socket)?;
    if send_buf > 0 {
        socket.set_send_buffer_size(send_buf as u32).map_err(|_| EtError::Socket)?;
    }
    if recv_buf > 0 {
        socket.set_recv_buffer_size(recv_buf as u32).map_err(|_| EtError::Socket)?;
    }
    if let Some(ip) = interface {
        socket
            .bind(SocketAddr::V4(SocketAddrV4::new(ip, 0)))
            .map_err(|_| EtError::Socket)?;
    }

    let connect = socket.connect(addr);
    let stream = match deadline {
        Some(d) => tokio::time::timeout(d, connect)
            .await
            .map_err(|_| EtError::Timeout)?
            .map_err(|_| EtError::Network)?,
        None => connect.await.map_err(|_| EtError::Network)?,
    };
    if nodelay {
        stream.set_nodelay(true).map_err(|_| EtError::Socket)?;
    }
    Ok(stream)
}

/// Bind a UDP socket on `0.0.0.0:port` with SO_REUSEADDR (and
/// SO_REUSEPORT where it exists) so several processes can share the
/// discovery port, then join every multicast group on each UP
/// non-loopback IPv4 interface.
pub fn udp_receive_all(port: u16, mcast_addrs: &[Ipv4Addr]) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|_| EtError::Socket)?;
    socket.set_reuse_address(true).map_err(|_| EtError::Socket)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true).map_err(|_| EtError::Socket)?;
    socket.set_nonblocking(true).map_err(|_| EtError::Socket)?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .map_err(|_| EtError::Socket)?;

    let interfaces = iface::usable_interfaces();
    for &group in mcast_addrs {
        let mut joined = false;
        for ifc in &interfaces {
            match socket.join_multicast_v4(&group, &ifc.addr) {
                Ok(()) => joined = true,
                Err(e) => {
                    debug!(%group, iface = %ifc.addr, error = %e, "multicast join failed")
                }
            }
        }
        // Fall back to the default interface when enumeration came up dry.
        if !joined {
            if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                warn!(%group, error = %e, "cannot join multicast group");
            }
        }
    }

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|_| EtError::Socket)
}

/// Ephemeral sending socket with SO_BROADCAST set.
pub fn udp_broadcast_sender() -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|_| EtError::Socket)?;
    socket.set_broadcast(true).map_err(|_| EtError::Socket)?;
    socket.set_nonblocking(true).map_err(|_| EtError::Socket)?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
        .map_err(|_| EtError::Socket)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|_| EtError::Socket)
}

/// Ephemeral sending socket for one multicast group with the given TTL.
pub fn udp_multicast_sender(ttl: u32) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|_| EtError::Socket)?;
    socket.set_nonblocking(true).map_err(|_| EtError::Socket)?;
    if ttl != 1 {
        socket.set_multicast_ttl_v4(ttl).map_err(|_| EtError::Socket)?;
    }
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
        .map_err(|_| EtError::Socket)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|_| EtError::Socket)
}
