use anyhow::Result;
use seahaven::{driver, Config, Handler, Protocol};
use std::net::SocketAddr;

fn init_log() {
  // default RUST_LOG=info
  std::env::set_var(
    "RUST_LOG",
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
  );
  env_logger::init();
}

struct Echo {
  sender: driver::Sender,
}

impl Handler for Echo {
  fn on_receive(&mut self, addr: SocketAddr, payload: &[u8]) {
    log::info!("echoing {} bytes to {addr}", payload.len());
    self.sender.send(addr, payload.to_vec(), true);
  }
}

fn main() -> Result<()> {
  init_log();

  let addr: SocketAddr = "127.0.0.1:9000".parse()?;
  let config = Config {
    protocol: Protocol::from("seahaven-echo"),
    ..Config::default()
  };
  let (_sender, local_addr, handle) = driver::listen(addr, config, |sender| Echo { sender })?;
  log::info!("server listening on {local_addr}");

  handle.join().expect("driver thread panicked")?;
  Ok(())
}
