use crate::{packet, Protocol};
use std::time::Duration;
use thiserror::Error;

/// Smallest allowed `max_packet_size`. Anything below this cannot fit the
/// fragment header plus a useful payload.
pub const MIN_PACKET_SIZE: usize = 64;
/// Largest allowed `max_packet_size` (one UDP datagram).
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("max_packet_size {0} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}")]
  PacketSize(usize),
  #[error("max_connections must be at least 1")]
  NoConnections,
  #[error("sequence_bits {0} outside 4..=16")]
  SequenceBits(u32),
  #[error("timeout must exceed keep_alive_interval or idle connections die")]
  TimeoutBelowKeepAlive,
  #[error("max_resend_attempts must be at least 1")]
  NoResendAttempts,
}

/// Immutable transport tunables.
///
/// Created once at peer startup, validated, then shared by reference across
/// all connections.
#[derive(Debug, Clone)]
pub struct Config {
  /// Opaque token identifying the application protocol and its version.
  /// Connect requests carrying a different token are rejected.
  pub protocol: Protocol,
  /// Upper bound on live connections in the peer table.
  pub max_connections: usize,
  /// Maximum datagram size, headers included. Derived from a conservative
  /// MTU assumption; payloads that do not fit are fragmented.
  pub max_packet_size: usize,
  /// Send a keep-alive when nothing has been sent for this long.
  pub keep_alive_interval: Duration,
  /// Declare the connection dead when nothing has been received for this
  /// long. Must exceed `keep_alive_interval`.
  pub timeout: Duration,
  /// Retransmit an unacked reliable packet after this long.
  pub resend_interval: Duration,
  /// Retransmissions allowed per reliable packet before the connection is
  /// declared lost.
  pub max_resend_attempts: u32,
  /// Retransmit an unanswered connect request after this long.
  pub connect_interval: Duration,
  /// Connect request retransmissions before giving up.
  pub max_connect_attempts: u32,
  /// Drop a partial fragmented message when no chunk arrived for this long.
  pub fragment_timeout: Duration,
  /// How long `Disconnecting` keeps flushing the disconnect notification
  /// before going terminal.
  pub disconnect_grace: Duration,
  /// Width of the sequence-number space in bits (4..=16). The wire field is
  /// always 16 bits; narrower widths shrink the arithmetic window.
  pub sequence_bits: u32,
  /// Unacked reliable packets allowed in flight per connection.
  pub send_window: usize,
  /// Number of per-tick metric samples retained.
  pub metrics_window: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      protocol: Protocol(0),
      max_connections: 64,
      max_packet_size: 1280,
      keep_alive_interval: Duration::from_secs(2),
      timeout: Duration::from_secs(10),
      resend_interval: Duration::from_millis(250),
      max_resend_attempts: 20,
      connect_interval: Duration::from_millis(250),
      max_connect_attempts: 20,
      fragment_timeout: Duration::from_secs(5),
      disconnect_grace: Duration::from_secs(1),
      sequence_bits: 16,
      send_window: 512,
      metrics_window: 128,
    }
  }
}

impl Config {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.max_packet_size) {
      return Err(ConfigError::PacketSize(self.max_packet_size));
    }
    if self.max_connections == 0 {
      return Err(ConfigError::NoConnections);
    }
    if !(4..=16).contains(&self.sequence_bits) {
      return Err(ConfigError::SequenceBits(self.sequence_bits));
    }
    if self.timeout <= self.keep_alive_interval {
      return Err(ConfigError::TimeoutBelowKeepAlive);
    }
    if self.max_resend_attempts == 0 {
      return Err(ConfigError::NoResendAttempts);
    }
    Ok(())
  }

  /// Largest payload that fits an unfragmented data packet.
  pub fn max_plain_payload(&self) -> usize {
    self.max_packet_size - packet::DATA_HEADER_LEN
  }

  /// Payload bytes carried per fragment packet.
  pub fn max_chunk_len(&self) -> usize {
    self.max_packet_size - packet::FRAGMENT_HEADER_LEN
  }

  /// Largest message expressible at all (fragmented).
  pub fn max_message_size(&self) -> usize {
    self.max_chunk_len() * crate::fragment::MAX_FRAGMENTS
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn default_config_is_valid() {
    assert_eq!(Config::default().validate(), Ok(()));
  }

  #[test]
  fn bad_values_are_named() {
    let config = Config { max_packet_size: 10, ..Config::default() };
    assert_eq!(config.validate(), Err(ConfigError::PacketSize(10)));

    let config = Config { sequence_bits: 32, ..Config::default() };
    assert_eq!(config.validate(), Err(ConfigError::SequenceBits(32)));

    let config = Config {
      keep_alive_interval: Duration::from_secs(10),
      timeout: Duration::from_secs(10),
      ..Config::default()
    };
    assert_eq!(config.validate(), Err(ConfigError::TimeoutBelowKeepAlive));
  }

  #[test]
  fn payload_budgets_account_for_headers() {
    let config = Config::default();
    assert_eq!(config.max_plain_payload(), 1280 - packet::DATA_HEADER_LEN);
    assert!(config.max_chunk_len() < config.max_plain_payload());
    assert_eq!(config.max_message_size(), config.max_chunk_len() * 255);
  }
}
