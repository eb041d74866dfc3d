//! Per-peer connection state machine.
//!
//! A connection owns one remote endpoint's lifecycle
//! (`Connecting → Connected → Disconnecting → Disconnected`) and wires the
//! inbound datagram stream into the ack window, the resend engine and the
//! reassembly table. It never touches the socket from a state transition;
//! all traffic goes out during the update pass, one call per tick.

use crate::{
  ack::{self, AckTracker, Classify},
  config::Config,
  error::{DisconnectReason, Error},
  fragment::{self, Reassembled, Reassembly},
  handler::Handler,
  metrics::Metrics,
  packet::{self, DataHeader, FragmentInfo, Inbound},
  pool::BufferPool,
  reliable::{PendingKind, ReliableSender},
  seq::Sequencer,
  socket::Socket,
  time::MovingAverage,
};
use std::{
  collections::VecDeque,
  io,
  net::SocketAddr,
  time::Instant,
};

/// RTT estimate averages roughly this many observations.
const RTT_OBSERVATIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  Connecting,
  Connected,
  Disconnecting,
  /// Terminal. The peer removes the connection after dispatching its
  /// disconnect event.
  Disconnected,
}

/// Idle-send timer: makes sure some packet leaves periodically so a silent
/// connection does not hit the remote side's receive timeout.
#[derive(Debug)]
struct KeepAliveTracker {
  last_send: Option<Instant>,
}

impl KeepAliveTracker {
  fn new() -> Self {
    Self { last_send: None }
  }

  fn time_to_send(&self, now: Instant, config: &Config) -> bool {
    match self.last_send {
      None => true,
      Some(at) => now.duration_since(at) >= config.keep_alive_interval,
    }
  }

  fn set_send_time(&mut self, now: Instant) {
    self.last_send = Some(now);
  }
}

struct Queued {
  payload: Vec<u8>,
  reliable: bool,
}

pub struct Connection {
  addr: SocketAddr,
  state: State,
  reason: Option<DisconnectReason>,
  /// Remote refused our connect request; reported via `on_rejected` instead
  /// of `on_disconnect`.
  rejected: bool,
  sequencer: Sequencer,
  ack: AckTracker,
  reliable: ReliableSender,
  reassembly: Reassembly,
  send_queue: VecDeque<Queued>,
  next_message_id: u16,
  keep_alive: KeepAliveTracker,
  rtt: MovingAverage,
  last_recv: Instant,
  connect_attempts: u32,
  last_connect_send: Option<Instant>,
  disconnecting_since: Option<Instant>,
  last_disconnect_send: Option<Instant>,
  /// A fresh reliable packet arrived and its ack has not left yet.
  ack_pending: bool,
}

impl Connection {
  fn new(addr: SocketAddr, state: State, config: &Config, now: Instant) -> Self {
    let sequencer = Sequencer::new(config.sequence_bits);
    let reliable = ReliableSender::new(config.send_window, &sequencer);
    Self {
      addr,
      state,
      reason: None,
      rejected: false,
      ack: AckTracker::new(config.sequence_bits),
      reliable,
      sequencer,
      reassembly: Reassembly::new(config.max_chunk_len()),
      send_queue: VecDeque::new(),
      next_message_id: 0,
      keep_alive: KeepAliveTracker::new(),
      rtt: MovingAverage::new(RTT_OBSERVATIONS),
      last_recv: now,
      connect_attempts: 0,
      last_connect_send: None,
      disconnecting_since: None,
      last_disconnect_send: None,
      ack_pending: false,
    }
  }

  /// Outbound connect attempt; the first request goes out on the next update.
  pub(crate) fn connect(addr: SocketAddr, config: &Config, now: Instant) -> Self {
    Self::new(addr, State::Connecting, config, now)
  }

  /// Inbound connect request accepted; the accept reply is sent by the peer.
  pub(crate) fn accept(addr: SocketAddr, config: &Config, now: Instant) -> Self {
    Self::new(addr, State::Connected, config, now)
  }

  pub fn state(&self) -> State {
    self.state
  }

  /// Smoothed round-trip estimate in seconds. Zero until the first reliable
  /// packet is acknowledged.
  pub fn rtt(&self) -> f64 {
    self.rtt.value()
  }

  pub(crate) fn reason(&self) -> Option<DisconnectReason> {
    self.reason
  }

  pub(crate) fn was_rejected(&self) -> bool {
    self.rejected
  }

  /// Queue a message. Reliable messages above the single-packet budget are
  /// fragmented when flushed; unreliable messages must fit one packet.
  pub(crate) fn send(&mut self, payload: &[u8], reliable: bool, config: &Config) -> Result<(), Error> {
    match self.state {
      State::Connecting | State::Connected => {}
      State::Disconnecting | State::Disconnected => return Err(Error::NotConnected(self.addr)),
    }
    let max = if reliable { config.max_message_size() } else { config.max_plain_payload() };
    if payload.len() > max {
      return Err(Error::PayloadTooLarge { len: payload.len(), max });
    }
    self.send_queue.push_back(Queued { payload: payload.to_vec(), reliable });
    Ok(())
  }

  /// Begin a graceful shutdown: flush a disconnect notification, then go
  /// terminal once acknowledged by echo or when the grace period elapses.
  pub(crate) fn disconnect(&mut self, now: Instant) {
    match self.state {
      State::Connecting | State::Connected => {
        log::debug!("{} disconnecting", self.addr);
        self.state = State::Disconnecting;
        self.disconnecting_since = Some(now);
      }
      State::Disconnecting | State::Disconnected => {}
    }
  }

  /// Skip the flush and go terminal now. Used for error paths.
  pub(crate) fn disconnect_immediate(&mut self, reason: DisconnectReason) {
    if self.state != State::Disconnected {
      self.terminate(reason);
    }
  }

  fn terminate(&mut self, reason: DisconnectReason) {
    debug_assert!(self.state != State::Disconnected);
    log::debug!("{} disconnected: {reason:?}", self.addr);
    self.state = State::Disconnected;
    self.reason = Some(reason);
    self.send_queue.clear();
  }

  /// Dispatch one decoded datagram. Connect requests from known endpoints
  /// are answered by the peer and never reach this point.
  pub(crate) fn handle<H: Handler>(
    &mut self,
    now: Instant,
    inbound: Inbound<'_>,
    handler: &mut H,
    metrics: &mut Metrics,
  ) {
    if self.state == State::Disconnected {
      return;
    }
    self.last_recv = now;

    match inbound {
      Inbound::ConnectRequest { .. } => {
        // handled by the peer before connection dispatch
        debug_assert!(false, "connect requests are answered by the peer");
      }
      Inbound::ConnectAccepted => {
        if self.state == State::Connecting {
          log::debug!("{} connected", self.addr);
          self.state = State::Connected;
          handler.on_connect(self.addr);
        }
      }
      Inbound::ConnectRejected { reason } => {
        if self.state == State::Connecting {
          log::debug!("{} refused our connect request: {reason:?}", self.addr);
          self.rejected = true;
          self.terminate(DisconnectReason::RemoteRequest);
        }
      }
      Inbound::Disconnect => match self.state {
        State::Connecting | State::Connected => self.terminate(DisconnectReason::RemoteRequest),
        // the notification we flushed was answered or crossed with theirs
        State::Disconnecting => self.terminate(DisconnectReason::LocalRequest),
        State::Disconnected => {}
      },
      Inbound::KeepAlive => {}
      Inbound::Ack(field) => self.process_acks(field, now),
      Inbound::Data { reliable, header, payload } => {
        if self.state != State::Connected {
          return;
        }
        self.process_acks(header.ack, now);
        match self.ack.on_receive(header.sequence) {
          Classify::Fresh => {
            if reliable {
              self.ack_pending = true;
            }
            handler.on_receive(self.addr, payload);
          }
          Classify::Duplicate => metrics.counters.duplicates += 1,
          Classify::Stale => metrics.counters.stale += 1,
        }
      }
      Inbound::Fragment { header, info, payload } => {
        if self.state != State::Connected {
          return;
        }
        self.process_acks(header.ack, now);
        match self.ack.on_receive(header.sequence) {
          Classify::Fresh => {
            self.ack_pending = true;
            match self.reassembly.on_fragment(info.message_id, info.index, info.count, payload, now)
            {
              Reassembled::Complete(message) => handler.on_receive(self.addr, &message),
              Reassembled::Incomplete => {}
              Reassembled::Invalid => metrics.counters.malformed += 1,
            }
          }
          Classify::Duplicate => metrics.counters.duplicates += 1,
          Classify::Stale => metrics.counters.stale += 1,
        }
      }
    }
  }

  fn process_acks(&mut self, field: packet::AckField, now: Instant) {
    let reliable = &mut self.reliable;
    let rtt = &mut self.rtt;
    ack::each_acked(self.sequencer.bits(), field, |sequence, is_latest| {
      if let Some(entry) = reliable.ack(sequence) {
        if is_latest && entry.attempts == 0 {
          // freshest sample, and unambiguous: the packet was sent exactly once
          rtt.add(now.duration_since(entry.last_sent).as_secs_f64());
        }
      }
    });
  }

  /// Drive timers and flush queued work. Called once per tick by the peer.
  /// IO errors other than `WouldBlock` are fatal for the whole peer and
  /// propagate.
  pub(crate) fn update<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
  ) -> io::Result<()> {
    match self.state {
      State::Connecting => self.update_connecting(now, config, socket, pool, metrics),
      State::Connected => self.update_connected(now, config, socket, pool, metrics),
      State::Disconnecting => self.update_disconnecting(now, config, socket, pool, metrics),
      State::Disconnected => Ok(()),
    }
  }

  fn update_connecting<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
  ) -> io::Result<()> {
    let due = match self.last_connect_send {
      None => true,
      Some(at) => now.duration_since(at) >= config.connect_interval,
    };
    if !due {
      return Ok(());
    }
    if self.connect_attempts >= config.max_connect_attempts {
      self.terminate(DisconnectReason::Timeout);
      return Ok(());
    }

    let mut buf = pool.take();
    packet::write_connect_request(&mut buf, config.protocol);
    let sent = self.transmit(now, socket, &buf, metrics)?;
    pool.put(buf);
    if sent {
      self.connect_attempts += 1;
      self.last_connect_send = Some(now);
    }
    Ok(())
  }

  fn update_connected<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
  ) -> io::Result<()> {
    if now.duration_since(self.last_recv) >= config.timeout {
      self.terminate(DisconnectReason::Timeout);
      return Ok(());
    }

    self.resend_due(now, config, socket, pool, metrics)?;
    if self.state != State::Connected {
      // resend exhaustion
      return Ok(());
    }

    self.flush_queue(now, config, socket, pool, metrics)?;

    if self.ack_pending {
      let mut buf = pool.take();
      packet::write_ack(&mut buf, self.ack.build_ack());
      if self.transmit(now, socket, &buf, metrics)? {
        self.ack_pending = false;
      }
      pool.put(buf);
    }

    if self.keep_alive.time_to_send(now, config) {
      let mut buf = pool.take();
      packet::write_keep_alive(&mut buf);
      self.transmit(now, socket, &buf, metrics)?;
      pool.put(buf);
    }

    metrics.counters.purged_fragments +=
      self.reassembly.purge(now, config.fragment_timeout) as u64;
    Ok(())
  }

  fn update_disconnecting<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
  ) -> io::Result<()> {
    let since = self.disconnecting_since.unwrap_or(now);
    if now.duration_since(since) >= config.disconnect_grace {
      self.terminate(DisconnectReason::LocalRequest);
      return Ok(());
    }

    let due = match self.last_disconnect_send {
      None => true,
      Some(at) => now.duration_since(at) >= config.connect_interval,
    };
    if due {
      let mut buf = pool.take();
      packet::write_disconnect(&mut buf);
      if self.transmit(now, socket, &buf, metrics)? {
        self.last_disconnect_send = Some(now);
      }
      pool.put(buf);
    }
    Ok(())
  }

  /// Retransmit every due unacked reliable packet with fresh ack state.
  fn resend_due<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
  ) -> io::Result<()> {
    let ack_field = self.ack.build_ack();
    let addr = self.addr;
    let mut sent_any = false;
    let mut io_error = None;

    let result = self.reliable.update(
      now,
      config.resend_interval,
      config.max_resend_attempts,
      |sequence, entry| {
        if io_error.is_some() {
          return;
        }
        let mut buf = pool.take();
        let header = DataHeader { sequence, ack: ack_field };
        match entry.kind {
          PendingKind::Reliable => packet::write_data(&mut buf, true, header, &entry.payload),
          PendingKind::Fragment { message_id, index, count } => {
            let info = FragmentInfo { message_id, index, count };
            packet::write_fragment(&mut buf, header, info, &entry.payload);
          }
        }
        match socket.send_to(&buf, addr) {
          Ok(n) => {
            metrics.on_send(n);
            sent_any = true;
          }
          // leave it for the next interval
          Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
          Err(e) => io_error = Some(e),
        }
        pool.put(buf);
      },
    );

    if let Some(e) = io_error {
      return Err(e);
    }
    if sent_any {
      self.keep_alive.set_send_time(now);
      if !ack_field.is_empty() {
        self.ack_pending = false;
      }
    }
    if let Err(exhausted) = result {
      log::warn!(
        "{} lost: packet {} unacked after {} retransmissions",
        self.addr,
        exhausted.sequence,
        exhausted.attempts
      );
      self.terminate(DisconnectReason::Timeout);
    }
    Ok(())
  }

  /// Dequeue messages while the socket and the send window keep up.
  fn flush_queue<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
  ) -> io::Result<()> {
    loop {
      let (reliable, chunks) = match self.send_queue.front() {
        None => break,
        Some(m) => {
          let chunks = if m.reliable && m.payload.len() > config.max_plain_payload() {
            m.payload.len().div_ceil(config.max_chunk_len())
          } else {
            1
          };
          (m.reliable, chunks)
        }
      };
      if reliable && !self.window_accepts(chunks) {
        break;
      }
      let message = match self.send_queue.pop_front() {
        Some(m) => m,
        None => break,
      };
      if reliable {
        if !self.send_reliable(now, config, socket, pool, metrics, message.payload)? {
          break;
        }
      } else {
        let header = DataHeader { sequence: self.sequencer.peek(), ack: self.ack.build_ack() };
        let mut buf = pool.take();
        packet::write_data(&mut buf, false, header, &message.payload);
        let sent = self.transmit(now, socket, &buf, metrics)?;
        pool.put(buf);
        if !sent {
          // retry next tick, keep ordering
          self.send_queue.push_front(message);
          break;
        }
        self.sequencer.next();
        if !header.ack.is_empty() {
          self.ack_pending = false;
        }
      }
    }
    Ok(())
  }

  /// Whether the next `chunks` consecutive sequence numbers can all be
  /// tracked. Checks both the in-flight budget and slot collisions with
  /// entries from a previous sequence lap.
  fn window_accepts(&self, chunks: usize) -> bool {
    if !self.reliable.has_room(chunks) {
      return false;
    }
    let mut probe = self.sequencer.clone();
    (0..chunks).all(|_| self.reliable.will_accept(probe.next()))
  }

  /// Transmit and track one reliable message, fragmenting if needed.
  /// Returns `false` when the socket pushed back mid-message; already
  /// transmitted chunks stay tracked and will be resent if unacked.
  fn send_reliable<S: Socket>(
    &mut self,
    now: Instant,
    config: &Config,
    socket: &S,
    pool: &mut BufferPool,
    metrics: &mut Metrics,
    payload: Vec<u8>,
  ) -> io::Result<bool> {
    if payload.len() <= config.max_plain_payload() {
      let sequence = self.sequencer.next();
      let header = DataHeader { sequence, ack: self.ack.build_ack() };
      let mut buf = pool.take();
      packet::write_data(&mut buf, true, header, &payload);
      let sent = self.transmit(now, socket, &buf, metrics)?;
      pool.put(buf);
      if sent && !header.ack.is_empty() {
        self.ack_pending = false;
      }
      // tracked even when the socket pushed back; the resend pass retries
      self
        .reliable
        .track(sequence, PendingKind::Reliable, payload, now)
        .expect("window_accepts checked the slot");
      return Ok(sent);
    }

    let message_id = self.next_message_id;
    self.next_message_id = self.next_message_id.wrapping_add(1);
    // window_accepts bounded the chunk count, and `send` bounded the size
    let chunks = fragment::split(&payload, config.max_chunk_len())
      .expect("message size was validated in send");
    let mut blocked = false;
    for (index, count, chunk) in chunks {
      let sequence = self.sequencer.next();
      let header = DataHeader { sequence, ack: self.ack.build_ack() };
      let info = FragmentInfo { message_id, index, count };
      let mut buf = pool.take();
      packet::write_fragment(&mut buf, header, info, chunk);
      let sent = self.transmit(now, socket, &buf, metrics)?;
      pool.put(buf);
      if sent && !header.ack.is_empty() {
        self.ack_pending = false;
      }
      blocked |= !sent;
      let kind = PendingKind::Fragment { message_id, index, count };
      self
        .reliable
        .track(sequence, kind, chunk.to_vec(), now)
        .expect("window_accepts checked the slots");
    }
    Ok(!blocked)
  }

  /// Send one already-framed packet. `Ok(false)` means the socket would
  /// block; anything else non-fatal counts as sent.
  fn transmit<S: Socket>(
    &mut self,
    now: Instant,
    socket: &S,
    buf: &[u8],
    metrics: &mut Metrics,
  ) -> io::Result<bool> {
    match socket.send_to(buf, self.addr) {
      Ok(n) => {
        metrics.on_send(n);
        self.keep_alive.set_send_time(now);
        Ok(true)
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
      Err(e) => Err(e),
    }
  }
}
