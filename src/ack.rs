//! Receive-side acknowledgement window.
//!
//! Translates the stream of inbound sequence numbers into the ack field echoed
//! on outgoing packets, and classifies each arrival so the connection can
//! suppress duplicates without desynchronizing its ack state.

use crate::{
  packet::AckField,
  seq::{self, Seq},
};

/// Width of the ack mask in bits. Bit 0 covers the latest received sequence.
pub const WINDOW: u32 = 64;

/// How an inbound sequence number relates to the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classify {
  /// First sighting, deliver it.
  Fresh,
  /// Already seen, drop it.
  Duplicate,
  /// Older than the trailing edge of the window. Indistinguishable from a
  /// duplicate, treated the same way.
  Stale,
}

#[derive(Debug)]
pub struct AckTracker {
  bits: u32,
  latest: Seq,
  mask: u64,
}

impl AckTracker {
  pub fn new(bits: u32) -> Self {
    Self { bits, latest: 0, mask: 0 }
  }

  /// Record an inbound sequence number.
  ///
  /// The window never regresses: stale and duplicate input leaves `latest`
  /// and the mask untouched.
  pub fn on_receive(&mut self, sequence: Seq) -> Classify {
    if self.mask == 0 {
      // nothing received yet
      self.latest = sequence;
      self.mask = 1;
      return Classify::Fresh;
    }

    let distance = seq::distance(self.bits, sequence, self.latest);
    if distance > 0 {
      // window advances, bits for sequences older than the new latest shift up
      self.mask = if distance >= WINDOW as i32 { 0 } else { self.mask << distance };
      self.mask |= 1;
      self.latest = sequence;
      Classify::Fresh
    } else {
      let offset = -distance as u32;
      if offset >= WINDOW {
        return Classify::Stale;
      }
      let bit = 1u64 << offset;
      if self.mask & bit != 0 {
        Classify::Duplicate
      } else {
        self.mask |= bit;
        Classify::Fresh
      }
    }
  }

  /// Ack state to piggy-back on the next outgoing packet.
  pub fn build_ack(&self) -> AckField {
    AckField { sequence: self.latest, mask: self.mask }
  }
}

/// Walk an inbound ack field, calling `f(sequence, is_latest)` for every
/// acknowledged sequence number. `is_latest` marks the packet whose round trip
/// gives the freshest RTT sample.
///
/// An empty field (zero mask) carries no information and produces no calls.
pub fn each_acked(bits: u32, field: AckField, mut f: impl FnMut(Seq, bool)) {
  if field.is_empty() {
    return;
  }
  for i in 0..WINDOW {
    if field.mask & (1u64 << i) != 0 {
      f(seq::sub(bits, field.sequence, i as u16), i == 0);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn mask_bit_i_means_latest_minus_i() {
    let mut tracker = AckTracker::new(16);
    // receive 0, 2, 3, 7 (gaps at 1, 4, 5, 6)
    for s in [0, 2, 3, 7] {
      assert_eq!(tracker.on_receive(s), Classify::Fresh);
    }
    let ack = tracker.build_ack();
    assert_eq!(ack.sequence, 7);
    for i in 0..WINDOW as u16 {
      let received = matches!(i, 0 | 4 | 5 | 7);
      assert_eq!(ack.mask & (1 << i) != 0, received, "bit {i}");
    }
  }

  #[test]
  fn duplicates_and_stale_are_classified() {
    let mut tracker = AckTracker::new(16);
    assert_eq!(tracker.on_receive(100), Classify::Fresh);
    assert_eq!(tracker.on_receive(100), Classify::Duplicate);
    // inside the window, unseen
    assert_eq!(tracker.on_receive(80), Classify::Fresh);
    assert_eq!(tracker.on_receive(80), Classify::Duplicate);
    // behind the trailing edge
    assert_eq!(tracker.on_receive(100 - WINDOW as u16), Classify::Stale);
    // none of that moved the window
    assert_eq!(tracker.build_ack().sequence, 100);
  }

  #[test]
  fn window_never_regresses() {
    let mut tracker = AckTracker::new(8);
    tracker.on_receive(10);
    tracker.on_receive(5);
    assert_eq!(tracker.build_ack().sequence, 10);
    tracker.on_receive(11);
    assert_eq!(tracker.build_ack().sequence, 11);
  }

  #[test]
  fn far_jump_clears_old_bits() {
    let mut tracker = AckTracker::new(16);
    tracker.on_receive(1);
    tracker.on_receive(1 + WINDOW as u16 + 10);
    let ack = tracker.build_ack();
    assert_eq!(ack.mask, 1);
  }

  #[test]
  fn fresh_across_wraparound() {
    let mut tracker = AckTracker::new(8);
    // approach the wrap
    for s in 250..=255u16 {
      assert_eq!(tracker.on_receive(s), Classify::Fresh, "seq {s}");
    }
    // cross it: 0, 1, 2 are genuinely new, not stale
    for s in 0..3u16 {
      assert_eq!(tracker.on_receive(s), Classify::Fresh, "seq {s}");
    }
    assert_eq!(tracker.build_ack().sequence, 2);
    // 255 is 3 behind the new latest
    assert_eq!(tracker.build_ack().mask & (1 << 3) != 0, true);
  }

  #[test]
  fn each_acked_walks_set_bits() {
    let mut acked = Vec::new();
    each_acked(16, AckField { sequence: 9, mask: 0b1011 }, |s, latest| acked.push((s, latest)));
    assert_eq!(acked, vec![(9, true), (8, false), (6, false)]);

    acked.clear();
    each_acked(16, AckField::NONE, |s, latest| acked.push((s, latest)));
    assert!(acked.is_empty());
  }

  #[test]
  fn each_acked_wraps() {
    let mut acked = Vec::new();
    each_acked(8, AckField { sequence: 1, mask: 0b111 }, |s, _| acked.push(s));
    assert_eq!(acked, vec![1, 0, 255]);
  }
}
