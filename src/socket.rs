use mio::net::UdpSocket;
use std::{io, net::SocketAddr};

/// Non-blocking datagram socket, injected into the peer.
///
/// Both methods must never block: `recv_from` returns `WouldBlock` when no
/// datagram is queued, `send_to` returns `WouldBlock` when the send buffer is
/// full. Endpoint identity is the `SocketAddr`.
pub trait Socket {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Socket for UdpSocket {
  fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
    self.send_to(buf, target)
  }

  fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    self.recv_from(buf)
  }
}

/// Bind a server-mode socket on `addr`. mio sockets are non-blocking by
/// construction.
pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
  UdpSocket::bind(addr)
}

/// Bind a client-mode socket on an ephemeral local port.
pub fn bind_any() -> io::Result<UdpSocket> {
  UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0).into())
}
