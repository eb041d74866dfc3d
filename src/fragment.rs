//! Fragmentation of oversized messages and keyed reassembly.
//!
//! Messages above the MTU-derived threshold are split into at most 255 chunks
//! tagged `{message id, index, count}`. The receive side buffers chunks per
//! message id, delivers the byte-identical payload once all chunks are
//! present, and purges partial messages that stall past a timeout.

use std::{
  collections::HashMap,
  time::{Duration, Instant},
};

/// Maximum number of chunks per message; the index and count fields are u8.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Split `payload` into `(index, count, chunk)` triples of at most
/// `max_chunk_len` bytes. Returns `None` when the payload needs more than
/// [`MAX_FRAGMENTS`] chunks.
///
/// The caller is responsible for only invoking this above the fragmentation
/// threshold; a payload that fits one chunk yields a single triple.
pub fn split(payload: &[u8], max_chunk_len: usize) -> Option<impl Iterator<Item = (u8, u8, &[u8])>> {
  debug_assert!(max_chunk_len > 0);
  let count = payload.len().div_ceil(max_chunk_len).max(1);
  if count > MAX_FRAGMENTS {
    return None;
  }
  let count_u8 = count as u8;
  Some(
    payload
      .chunks(max_chunk_len)
      .enumerate()
      .map(move |(i, chunk)| (i as u8, count_u8, chunk)),
  )
}

struct Partial {
  chunks: Vec<Option<Vec<u8>>>,
  missing: usize,
  last_arrival: Instant,
}

/// Per-connection reassembly table, keyed by message id.
pub struct Reassembly {
  partial: HashMap<u16, Partial>,
  max_chunk_len: usize,
}

/// Outcome of feeding one fragment into the table.
pub enum Reassembled {
  /// Message complete; the payload is byte-identical to the sender's.
  Complete(Vec<u8>),
  /// Chunk stored, more outstanding.
  Incomplete,
  /// Chunk dropped: inconsistent with what is already buffered, oversized,
  /// or a duplicate index. Diagnostic only.
  Invalid,
}

impl Reassembly {
  pub fn new(max_chunk_len: usize) -> Self {
    Self { partial: HashMap::new(), max_chunk_len }
  }

  pub fn on_fragment(
    &mut self,
    message_id: u16,
    index: u8,
    count: u8,
    bytes: &[u8],
    now: Instant,
  ) -> Reassembled {
    if count == 0 || index >= count || bytes.len() > self.max_chunk_len {
      return Reassembled::Invalid;
    }
    // every chunk except the last is exactly max_chunk_len
    if index + 1 != count && bytes.len() != self.max_chunk_len {
      return Reassembled::Invalid;
    }

    let entry = self.partial.entry(message_id).or_insert_with(|| Partial {
      chunks: vec![None; count as usize],
      missing: count as usize,
      last_arrival: now,
    });
    if entry.chunks.len() != count as usize || entry.chunks[index as usize].is_some() {
      return Reassembled::Invalid;
    }

    entry.chunks[index as usize] = Some(bytes.to_vec());
    entry.missing -= 1;
    entry.last_arrival = now;
    if entry.missing > 0 {
      return Reassembled::Incomplete;
    }

    // missing == 0, every slot is filled
    let entry = self.partial.remove(&message_id).unwrap();
    let mut payload = Vec::with_capacity(
      (count as usize - 1) * self.max_chunk_len + bytes.len(),
    );
    for chunk in entry.chunks {
      payload.extend_from_slice(&chunk.unwrap());
    }
    Reassembled::Complete(payload)
  }

  /// Drop partial messages whose last chunk arrived more than `timeout` ago.
  /// Returns how many were purged, for the diagnostic counters.
  pub fn purge(&mut self, now: Instant, timeout: Duration) -> usize {
    let before = self.partial.len();
    self.partial.retain(|_, p| now.duration_since(p.last_arrival) < timeout);
    before - self.partial.len()
  }

  pub fn in_progress(&self) -> usize {
    self.partial.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  const CHUNK: usize = 64;

  fn round_trip(payload: &[u8]) -> Vec<u8> {
    let now = Instant::now();
    let mut reassembly = Reassembly::new(CHUNK);
    let mut out = None;
    for (index, count, chunk) in split(payload, CHUNK).unwrap() {
      match reassembly.on_fragment(7, index, count, chunk, now) {
        Reassembled::Complete(bytes) => out = Some(bytes),
        Reassembled::Incomplete => {}
        Reassembled::Invalid => panic!("chunk {index} rejected"),
      }
    }
    out.expect("message did not complete")
  }

  #[test]
  fn split_and_reassemble_byte_identical() {
    for len in [1usize, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK, 10 * CHUNK + 3] {
      let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
      assert_eq!(round_trip(&payload), payload, "len {len}");
    }
  }

  #[test]
  fn out_of_order_arrival_completes() {
    let payload: Vec<u8> = (0..3 * CHUNK + 5).map(|i| i as u8).collect();
    let chunks: Vec<(u8, u8, Vec<u8>)> =
      split(&payload, CHUNK).unwrap().map(|(i, c, b)| (i, c, b.to_vec())).collect();
    let now = Instant::now();
    let mut reassembly = Reassembly::new(CHUNK);
    let mut out = None;
    for (index, count, chunk) in chunks.into_iter().rev() {
      if let Reassembled::Complete(bytes) = reassembly.on_fragment(1, index, count, &chunk, now) {
        out = Some(bytes);
      }
    }
    assert_eq!(out.unwrap(), payload);
  }

  #[test]
  fn split_refuses_oversized_messages() {
    let too_big = vec![0u8; CHUNK * (MAX_FRAGMENTS + 1)];
    assert!(split(&too_big, CHUNK).is_none());
    let just_fits = vec![0u8; CHUNK * MAX_FRAGMENTS];
    assert_eq!(split(&just_fits, CHUNK).unwrap().count(), MAX_FRAGMENTS);
  }

  #[test]
  fn duplicate_chunk_is_invalid_not_double_counted() {
    let now = Instant::now();
    let mut reassembly = Reassembly::new(CHUNK);
    let chunk = vec![1u8; CHUNK];
    assert!(matches!(reassembly.on_fragment(3, 0, 2, &chunk, now), Reassembled::Incomplete));
    assert!(matches!(reassembly.on_fragment(3, 0, 2, &chunk, now), Reassembled::Invalid));
    // completing chunk still works
    assert!(matches!(reassembly.on_fragment(3, 1, 2, &[2u8; 10], now), Reassembled::Complete(_)));
  }

  #[test]
  fn stalled_messages_are_purged() {
    let now = Instant::now();
    let timeout = Duration::from_secs(5);
    let mut reassembly = Reassembly::new(CHUNK);
    reassembly.on_fragment(1, 0, 3, &[0u8; CHUNK], now);
    reassembly.on_fragment(2, 0, 2, &[0u8; CHUNK], now + Duration::from_secs(3));
    assert_eq!(reassembly.in_progress(), 2);

    // message 1 stalls past the timeout, message 2 does not
    assert_eq!(reassembly.purge(now + Duration::from_secs(6), timeout), 1);
    assert_eq!(reassembly.in_progress(), 1);

    // a late chunk for the purged message recreates it rather than completing
    assert!(matches!(
      reassembly.on_fragment(1, 1, 3, &[0u8; CHUNK], now + Duration::from_secs(6)),
      Reassembled::Incomplete
    ));
  }

  #[test]
  fn inconsistent_count_is_invalid() {
    let now = Instant::now();
    let mut reassembly = Reassembly::new(CHUNK);
    reassembly.on_fragment(9, 0, 4, &[0u8; CHUNK], now);
    assert!(matches!(reassembly.on_fragment(9, 1, 3, &[0u8; CHUNK], now), Reassembled::Invalid));
    // non-final chunk shorter than the chunk size
    assert!(matches!(reassembly.on_fragment(9, 1, 4, &[0u8; 5], now), Reassembled::Invalid));
  }
}
