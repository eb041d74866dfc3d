use crate::error::{DisconnectReason, Error};
use std::{borrow::Cow, net::SocketAddr};

/// Verdict for an inbound connect request, see
/// [`Handler::on_before_connect`].
pub enum Decision {
  Accept,
  Reject(Option<Cow<'static, str>>),
}

/// Event surface the peer drives. One implementation per embedding; the
/// replication layer above registers here.
pub trait Handler {
  /// Called once per fully reassembled, deduplicated application message.
  fn on_receive(&mut self, addr: SocketAddr, payload: &[u8]);

  /// Called before accepting an inbound connect request from `addr`.
  /// Returning `Reject(...)` refuses the endpoint without creating a
  /// connection; capacity and protocol checks happen before this hook.
  #[allow(unused_variables)]
  fn on_before_connect(&mut self, addr: SocketAddr) -> Decision {
    Decision::Accept
  }

  /// Called once when a connection becomes established, on both the
  /// accepting and the connecting side.
  fn on_connect(&mut self, addr: SocketAddr) {
    log::info!("{addr} connected");
  }

  /// Called exactly once when a connection reaches `Disconnected`.
  fn on_disconnect(&mut self, addr: SocketAddr, reason: DisconnectReason) {
    log::info!("{addr} disconnected ({reason:?})");
  }

  /// Called when a connect request involving `addr` was refused: on the
  /// server when it turns an endpoint away, on the client when the remote
  /// refuses its request. A refused client connection is removed without a
  /// separate `on_disconnect`.
  fn on_rejected(&mut self, addr: SocketAddr) {
    log::warn!("connection with {addr} rejected");
  }

  /// Called when the driver loop hits an unrecoverable error. Only used by
  /// the background-thread driver; tick embedders see errors as return
  /// values instead.
  fn on_error(&mut self, error: Error) {
    log::error!("{error}");
  }
}
