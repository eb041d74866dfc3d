use crate::config::ConfigError;
use std::{io, net::SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// The underlying socket is unusable. Fatal for the whole peer.
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  #[error("invalid config: {0}")]
  Config(#[from] ConfigError),
  /// No connection exists for this endpoint.
  #[error("unknown peer: {0}")]
  UnknownPeer(SocketAddr),
  /// The operation requires a live connection.
  #[error("connection to {0} is closed")]
  NotConnected(SocketAddr),
  /// The payload cannot be represented even after fragmentation.
  #[error("payload of {len} bytes exceeds the maximum message size of {max}")]
  PayloadTooLarge { len: usize, max: usize },
  /// The connection table is full.
  #[error("connection limit of {0} reached")]
  AtCapacity(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection reached `Disconnected`.
///
/// Reported exactly once per connection via [`Handler::on_disconnect`][h].
///
/// [h]: crate::handler::Handler::on_disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
  /// No traffic was received within the configured timeout, or a reliable
  /// packet exhausted its resend budget, or the connect handshake went
  /// unanswered.
  Timeout,
  /// The remote side sent a disconnect notification.
  RemoteRequest,
  /// The local side called `disconnect`.
  LocalRequest,
  /// The underlying socket failed while this connection was live.
  SocketError,
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn io_errors_convert() {
    let err = Error::from(io::Error::new(io::ErrorKind::AddrInUse, "bind failed"));
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(err.to_string(), "IO error: bind failed");
  }

  #[test]
  fn payload_too_large_names_both_sizes() {
    let err = Error::PayloadTooLarge { len: 1_000_000, max: 258_315 };
    assert!(err.to_string().contains("1000000"));
    assert!(err.to_string().contains("258315"));
  }
}
