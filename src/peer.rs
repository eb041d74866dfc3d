//! Endpoint owner: one socket, one handler, many connections.
//!
//! The peer is tick-driven and single-threaded. Embedders call
//! [`Peer::update_receive`] then [`Peer::update_send`] once per frame (or use
//! [`Peer::update`]); nothing touches the socket in between, and no internal
//! threads or locks exist. The driver module wraps this loop in a background
//! thread for embedders without a frame loop of their own.

use crate::{
  config::Config,
  connection::{Connection, State},
  error::{DisconnectReason, Error, Result},
  handler::{Decision, Handler},
  metrics::Metrics,
  packet::{self, Inbound, RejectReason},
  pool::BufferPool,
  socket::Socket,
  time::{Clock, SystemClock},
};
use indexmap::IndexMap;
use std::{io, net::SocketAddr};

/// Scratch buffers kept pooled between ticks.
const POOLED_BUFFERS: usize = 64;

pub struct Peer<S: Socket, H: Handler, C: Clock = SystemClock> {
  socket: S,
  handler: H,
  clock: C,
  config: Config,
  connections: IndexMap<SocketAddr, Connection>,
  pool: BufferPool,
  metrics: Metrics,
  recv_buffer: Vec<u8>,
}

impl<S: Socket, H: Handler> Peer<S, H> {
  pub fn new(socket: S, config: Config, handler: H) -> Result<Self> {
    Self::with_clock(socket, config, handler, SystemClock)
  }
}

impl<S: Socket, H: Handler, C: Clock> Peer<S, H, C> {
  pub fn with_clock(socket: S, config: Config, handler: H, clock: C) -> Result<Self> {
    config.validate()?;
    let pool = BufferPool::new(config.max_packet_size, POOLED_BUFFERS);
    let metrics = Metrics::new(config.metrics_window);
    Ok(Self {
      socket,
      handler,
      clock,
      config,
      connections: IndexMap::new(),
      pool,
      metrics,
      // large enough for any UDP datagram, so oversized input is decoded
      // (and rejected) instead of silently truncated
      recv_buffer: vec![0; u16::MAX as usize],
    })
  }

  /// Start connecting to `addr`. The handshake proceeds across subsequent
  /// update ticks; [`Handler::on_connect`] fires when it completes. A no-op
  /// if a connection to `addr` already exists.
  pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
    if self.connections.contains_key(&addr) {
      return Ok(());
    }
    if self.connections.len() >= self.config.max_connections {
      return Err(Error::AtCapacity(self.config.max_connections));
    }
    log::debug!("connecting to {addr}");
    let now = self.clock.now();
    self.connections.insert(addr, Connection::connect(addr, &self.config, now));
    Ok(())
  }

  /// Queue a message to `addr`. It leaves the socket on the next
  /// [`Peer::update_send`].
  pub fn send(&mut self, addr: SocketAddr, payload: &[u8], reliable: bool) -> Result<()> {
    let conn = self.connections.get_mut(&addr).ok_or(Error::UnknownPeer(addr))?;
    conn.send(payload, reliable, &self.config)
  }

  /// Begin a graceful disconnect: the remote side is notified, then the
  /// connection is removed and [`Handler::on_disconnect`] fires.
  pub fn disconnect(&mut self, addr: SocketAddr) -> Result<()> {
    let now = self.clock.now();
    let conn = self.connections.get_mut(&addr).ok_or(Error::UnknownPeer(addr))?;
    conn.disconnect(now);
    Ok(())
  }

  /// Drop the connection without notifying the remote side. The connection
  /// is removed synchronously and [`Handler::on_disconnect`] fires before
  /// this returns.
  pub fn disconnect_immediate(&mut self, addr: SocketAddr) -> Result<()> {
    match self.connections.shift_remove(&addr) {
      Some(conn) => {
        if conn.state() != State::Disconnected {
          self.handler.on_disconnect(addr, DisconnectReason::LocalRequest);
        }
        Ok(())
      }
      None => Err(Error::UnknownPeer(addr)),
    }
  }

  /// Gracefully disconnect every connection.
  pub fn disconnect_all(&mut self) {
    let now = self.clock.now();
    for conn in self.connections.values_mut() {
      conn.disconnect(now);
    }
  }

  /// Drop every connection with `reason`, firing one disconnect event each.
  /// Used when the socket itself has failed.
  pub fn abort_all(&mut self, reason: DisconnectReason) {
    for (addr, conn) in self.connections.drain(..) {
      if conn.state() != State::Disconnected {
        self.handler.on_disconnect(addr, reason);
      }
    }
  }

  /// One full tick: drain the socket, then flush all connections.
  pub fn update(&mut self) -> Result<()> {
    self.update_receive()?;
    self.update_send()
  }

  /// Drain the socket, decoding and dispatching every queued datagram.
  /// Returns once the socket reports `WouldBlock`. IO errors other than
  /// `WouldBlock` are fatal for the peer.
  pub fn update_receive(&mut self) -> Result<()> {
    let now = self.clock.now();
    let Self { socket, handler, clock: _, config, connections, pool, metrics, recv_buffer } = self;
    loop {
      let (len, addr) = match socket.recv_from(recv_buffer) {
        Ok(pair) => pair,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => return Err(e.into()),
      };
      metrics.on_receive(len);

      let inbound = match packet::parse(&recv_buffer[..len]) {
        Ok(inbound) => inbound,
        Err(e) => {
          log::trace!("dropping malformed datagram from {addr}: {e}");
          metrics.counters.malformed += 1;
          continue;
        }
      };

      match connections.get_mut(&addr) {
        Some(conn) => match inbound {
          // our accept reply was lost, answer the retry
          Inbound::ConnectRequest { protocol } => {
            if protocol == config.protocol && conn.state() == State::Connected {
              reply(socket, pool, metrics, addr, |buf| packet::write_connect_accepted(buf))?;
            }
          }
          other => conn.handle(now, other, handler, metrics),
        },
        None => match inbound {
          Inbound::ConnectRequest { protocol } => {
            if protocol != config.protocol {
              log::debug!("{addr} refused: wrong protocol {protocol:?}");
              metrics.counters.rejected_connects += 1;
              reply(socket, pool, metrics, addr, |buf| {
                packet::write_connect_rejected(buf, RejectReason::BadProtocol)
              })?;
            } else if connections.len() >= config.max_connections {
              log::debug!("{addr} refused: at capacity");
              metrics.counters.rejected_connects += 1;
              handler.on_rejected(addr);
              reply(socket, pool, metrics, addr, |buf| {
                packet::write_connect_rejected(buf, RejectReason::Capacity)
              })?;
            } else {
              match handler.on_before_connect(addr) {
                Decision::Reject(why) => {
                  match &why {
                    Some(why) => log::debug!("{addr} refused by application: {why}"),
                    None => log::debug!("{addr} refused by application"),
                  }
                  metrics.counters.rejected_connects += 1;
                  reply(socket, pool, metrics, addr, |buf| {
                    packet::write_connect_rejected(buf, RejectReason::Policy)
                  })?;
                }
                Decision::Accept => {
                  reply(socket, pool, metrics, addr, |buf| packet::write_connect_accepted(buf))?;
                  connections.insert(addr, Connection::accept(addr, config, now));
                  log::debug!("{addr} accepted");
                  handler.on_connect(addr);
                }
              }
            }
          }
          _ => {
            log::trace!("datagram from unknown endpoint {addr}");
            metrics.counters.unknown_endpoint += 1;
          }
        },
      }
    }
  }

  /// Flush all connections: handshake retries, reliable resends, queued
  /// messages, acks and keep-alives. Connections that reached `Disconnected`
  /// are removed here and their event fires exactly once. Closes out the
  /// current metrics tick.
  pub fn update_send(&mut self) -> Result<()> {
    let now = self.clock.now();
    {
      let Self { socket, config, connections, pool, metrics, .. } = self;
      for conn in connections.values_mut() {
        conn.update(now, config, &*socket, pool, metrics)?;
      }
    }

    let done: Vec<SocketAddr> = self
      .connections
      .iter()
      .filter(|(_, conn)| conn.state() == State::Disconnected)
      .map(|(addr, _)| *addr)
      .collect();
    for addr in done {
      if let Some(conn) = self.connections.shift_remove(&addr) {
        if conn.was_rejected() {
          self.handler.on_rejected(addr);
        } else {
          let reason = conn.reason().unwrap_or(DisconnectReason::Timeout);
          self.handler.on_disconnect(addr, reason);
        }
      }
    }

    self.metrics.end_tick(self.connections.len());
    Ok(())
  }

  pub fn state(&self, addr: SocketAddr) -> Option<State> {
    self.connections.get(&addr).map(|conn| conn.state())
  }

  /// Smoothed round-trip estimate for `addr`, in seconds.
  pub fn rtt(&self, addr: SocketAddr) -> Option<f64> {
    self.connections.get(&addr).map(|conn| conn.rtt())
  }

  pub fn connection_count(&self) -> usize {
    self.connections.len()
  }

  pub fn connections(&self) -> impl Iterator<Item = SocketAddr> + '_ {
    self.connections.keys().copied()
  }

  pub fn metrics(&self) -> &Metrics {
    &self.metrics
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn socket(&self) -> &S {
    &self.socket
  }

  pub fn handler(&self) -> &H {
    &self.handler
  }

  pub fn handler_mut(&mut self) -> &mut H {
    &mut self.handler
  }
}

/// Send one control packet outside any connection. `WouldBlock` is dropped;
/// the handshake retry will cover it.
fn reply<S: Socket>(
  socket: &S,
  pool: &mut BufferPool,
  metrics: &mut Metrics,
  addr: SocketAddr,
  write: impl FnOnce(&mut Vec<u8>),
) -> io::Result<()> {
  let mut buf = pool.take();
  write(&mut buf);
  let result = match socket.send_to(&buf, addr) {
    Ok(n) => {
      metrics.on_send(n);
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
    Err(e) => Err(e),
  };
  pool.put(buf);
  result
}
