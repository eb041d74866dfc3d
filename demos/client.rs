use anyhow::Result;
use seahaven::{driver, Config, DisconnectReason, Handler, Protocol};
use std::{net::SocketAddr, sync::mpsc, time::Duration};

fn init_log() {
  // default RUST_LOG=info
  std::env::set_var(
    "RUST_LOG",
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
  );
  env_logger::init();
}

struct Client {
  tx: mpsc::Sender<Vec<u8>>,
}

impl Handler for Client {
  fn on_receive(&mut self, _addr: SocketAddr, payload: &[u8]) {
    let _ = self.tx.send(payload.to_vec());
  }

  fn on_connect(&mut self, addr: SocketAddr) {
    log::info!("connected to {addr}");
  }

  fn on_disconnect(&mut self, addr: SocketAddr, reason: DisconnectReason) {
    log::info!("disconnected from {addr}: {reason:?}");
  }
}

fn main() -> Result<()> {
  init_log();

  let server: SocketAddr = "127.0.0.1:9000".parse()?;
  let config = Config {
    protocol: Protocol::from("seahaven-echo"),
    ..Config::default()
  };
  let (tx, rx) = mpsc::channel();
  let (sender, _, _handle) = driver::connect(server, config, move |_| Client { tx })?;

  for i in 0..10u32 {
    let message = format!("message {i}");
    sender.send(server, message.clone().into_bytes(), true);
    let echoed = rx.recv_timeout(Duration::from_secs(5))?;
    log::info!("sent '{message}', echoed '{}'", String::from_utf8_lossy(&echoed));
  }

  sender.shutdown();
  Ok(())
}
