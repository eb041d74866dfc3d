//! Background-thread embedding.
//!
//! The peer itself is tick-driven and expects the embedder to own the loop.
//! For applications without a frame loop, this module runs the tick on a
//! dedicated thread: commands come in over a channel, events go out through
//! the [`Handler`] (which therefore must be `Send`). The loop wakes on
//! inbound traffic or after one tick interval, whichever comes first.

use crate::{
  config::Config,
  error::{DisconnectReason, Result},
  handler::Handler,
  peer::Peer,
  socket,
};
use crossbeam::channel::{self, Receiver, Sender as RawSender, TryRecvError};
use mio::{net::UdpSocket, Events, Interest, Poll, Token};
use std::{
  net::{Ipv4Addr, SocketAddr},
  thread::{self, JoinHandle},
  time::Duration,
};

const SOCKET: Token = Token(0);
const TICK: Duration = Duration::from_millis(1000 / 60);

enum Command {
  Connect { addr: SocketAddr },
  Send { addr: SocketAddr, payload: Vec<u8>, reliable: bool },
  Disconnect { addr: SocketAddr },
  Shutdown { signal: channel::Sender<()> },
}

/// Cloneable handle to the driver thread.
#[derive(Clone)]
pub struct Sender {
  chan: RawSender<Command>,
}

impl Sender {
  fn new(chan: RawSender<Command>) -> Self {
    Self { chan }
  }

  /// Start connecting to `addr`. Completion is reported through
  /// [`Handler::on_connect`].
  pub fn connect(&self, addr: SocketAddr) {
    self
      .chan
      .send(Command::Connect { addr })
      .expect("command channel is closed, did you call `connect` after `shutdown`?");
  }

  /// Queue a message to `addr`. Messages may be queued while the connection
  /// is still being established; they flush once it is up.
  pub fn send(&self, addr: SocketAddr, payload: Vec<u8>, reliable: bool) {
    self
      .chan
      .send(Command::Send { addr, payload, reliable })
      .expect("command channel is closed, did you call `send` after `shutdown`?");
  }

  /// Gracefully disconnect `addr`.
  pub fn disconnect(&self, addr: SocketAddr) {
    self
      .chan
      .send(Command::Disconnect { addr })
      .expect("command channel is closed, did you call `disconnect` after `shutdown`?");
  }

  /// Gracefully shut the driver down. Blocks until the loop has notified all
  /// remote sides and exited.
  pub fn shutdown(&self) {
    let (signal, wait) = channel::bounded(0);
    if self.chan.send(Command::Shutdown { signal }).is_ok() {
      let _ = wait.recv();
    }
  }
}

struct Driver<H: Handler> {
  peer: Peer<UdpSocket, H>,
  poll: Poll,
  events: Events,
  chan: Receiver<Command>,
  running: bool,
}

impl<H: Handler> Driver<H> {
  fn new(addr: SocketAddr, config: Config, chan: Receiver<Command>, handler: H) -> Result<Self> {
    let mut socket = socket::bind(addr)?;
    let poll = Poll::new()?;
    poll.registry().register(&mut socket, SOCKET, Interest::READABLE)?;
    let peer = Peer::new(socket, config, handler)?;
    Ok(Self { peer, poll, events: Events::with_capacity(1024), chan, running: true })
  }

  fn run(mut self) -> Result<()> {
    while self.running {
      if let Err(e) = self.tick() {
        // the socket is unusable, tear everything down
        self.peer.abort_all(DisconnectReason::SocketError);
        self.peer.handler_mut().on_error(e);
        return Ok(());
      }
    }
    Ok(())
  }

  fn tick(&mut self) -> Result<()> {
    // commands first, so a connect or send flushes within the same tick
    loop {
      match self.chan.try_recv() {
        Ok(Command::Connect { addr }) => {
          if let Err(e) = self.peer.connect(addr) {
            self.peer.handler_mut().on_error(e);
          }
        }
        Ok(Command::Send { addr, payload, reliable }) => {
          if let Err(e) = self.peer.send(addr, &payload, reliable) {
            self.peer.handler_mut().on_error(e);
          }
        }
        Ok(Command::Disconnect { addr }) => {
          if let Err(e) = self.peer.disconnect(addr) {
            self.peer.handler_mut().on_error(e);
          }
        }
        Ok(Command::Shutdown { signal }) => {
          self.close();
          let _ = signal.send(());
          return Ok(());
        }
        Err(TryRecvError::Empty) => break,
        // every handle dropped, same as a shutdown
        Err(TryRecvError::Disconnected) => {
          self.close();
          return Ok(());
        }
      }
    }

    self.poll.poll(&mut self.events, Some(TICK))?;
    self.peer.update()
  }

  fn close(&mut self) {
    self.running = false;
    // one best-effort notification flush, then drop whatever is left
    self.peer.disconnect_all();
    if let Err(e) = self.peer.update_send() {
      self.peer.handler_mut().on_error(e);
    }
    self.peer.abort_all(DisconnectReason::LocalRequest);
  }
}

/// Bind on `addr` and run the peer on a new thread. The factory receives the
/// command handle so the handler can talk back to the peer (echoing, kicking
/// endpoints). Returns the actual bound address, which matters when `addr`
/// uses port 0.
pub fn listen<F, H>(
  addr: SocketAddr,
  config: Config,
  factory: F,
) -> Result<(Sender, SocketAddr, JoinHandle<Result<()>>)>
where
  F: FnOnce(Sender) -> H,
  H: Handler + Send + 'static,
{
  let (raw, receiver) = channel::bounded(128);
  let sender = Sender::new(raw);
  let handler = factory(sender.clone());
  let driver = Driver::new(addr, config, receiver, handler)?;
  let local_addr = driver.peer.socket().local_addr()?;
  let handle = thread::spawn(move || driver.run());
  Ok((sender, local_addr, handle))
}

/// Bind an ephemeral local port and start connecting to `server`.
pub fn connect<F, H>(
  server: SocketAddr,
  config: Config,
  factory: F,
) -> Result<(Sender, SocketAddr, JoinHandle<Result<()>>)>
where
  F: FnOnce(Sender) -> H,
  H: Handler + Send + 'static,
{
  let (sender, local_addr, handle) =
    listen((Ipv4Addr::LOCALHOST, 0).into(), config, factory)?;
  sender.connect(server);
  Ok((sender, local_addr, handle))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::Protocol;
  use std::time::Duration;

  struct EchoBack {
    sender: Sender,
  }

  impl Handler for EchoBack {
    fn on_receive(&mut self, addr: SocketAddr, payload: &[u8]) {
      self.sender.send(addr, payload.to_vec(), true);
    }
  }

  struct Report {
    tx: channel::Sender<Vec<u8>>,
  }

  impl Handler for Report {
    fn on_receive(&mut self, _addr: SocketAddr, payload: &[u8]) {
      let _ = self.tx.send(payload.to_vec());
    }
  }

  fn config() -> Config {
    Config { protocol: Protocol(0x5EA), ..Config::default() }
  }

  #[test]
  fn echo_round_trip_over_localhost() {
    let (server, server_addr, _server_thread) =
      listen("127.0.0.1:0".parse().unwrap(), config(), |sender| EchoBack { sender }).unwrap();

    let (tx, rx) = channel::unbounded();
    let (client, _, _client_thread) =
      connect(server_addr, config(), move |_| Report { tx }).unwrap();

    client.send(server_addr, b"ping".to_vec(), true);
    let echoed = rx.recv_timeout(Duration::from_secs(5)).expect("echo must arrive");
    assert_eq!(echoed, b"ping");

    client.shutdown();
    server.shutdown();
  }
}
