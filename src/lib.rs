//! Reliable-UDP transport: connection handshakes, acknowledgement tracking,
//! retransmission, fragmentation and keep-alives over plain datagrams.
//!
//! The entry point is [`Peer`]: it owns one non-blocking socket and a table
//! of connections, and is driven by calling [`Peer::update_receive`] and
//! [`Peer::update_send`] once per tick from a single thread. Applications
//! without their own loop can use [`driver`] instead, which runs the tick on
//! a background thread.

pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod peer;
pub mod socket;
pub mod time;
pub mod varint;

mod ack;
mod connection;
mod fragment;
mod packet;
mod pool;
mod reliable;
mod seq;

pub use {
  config::Config,
  connection::State,
  error::{DisconnectReason, Error, Result},
  handler::{Decision, Handler},
  peer::Peer,
  socket::Socket,
};

use std::{
  collections::hash_map::DefaultHasher,
  hash::{Hash, Hasher},
};

/// Opaque application protocol token carried in every connect request.
/// Endpoints with mismatched tokens refuse each other, so bump it whenever
/// the application's message format changes incompatibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol(pub u64);

impl<T: Hash> From<T> for Protocol {
  fn from(v: T) -> Self {
    let mut s = DefaultHasher::new();
    v.hash(&mut s);
    Self(s.finish())
  }
}
