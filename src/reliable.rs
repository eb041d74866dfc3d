//! Send-side reliability: tracks unacknowledged packets and schedules resends.

use crate::seq::{self, Seq, Sequencer};
use std::time::{Duration, Instant};

/// How the payload was framed, so resends rebuild the same packet shape
/// (with fresh ack state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
  Reliable,
  Fragment { message_id: u16, index: u8, count: u8 },
}

#[derive(Debug)]
pub struct Pending {
  pub kind: PendingKind,
  pub payload: Vec<u8>,
  pub last_sent: Instant,
  /// Number of retransmissions so far (the initial send is not counted).
  pub attempts: u32,
}

/// A reliable packet ran out of resend attempts. Fatal for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
  pub sequence: Seq,
  pub attempts: u32,
}

/// In-flight entries beyond what the table can hold; the caller should stop
/// dequeuing new reliable sends until acks drain the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFull;

pub struct ReliableSender {
  pending: seq::Buffer<Pending>,
  capacity: usize,
  in_flight: usize,
}

impl ReliableSender {
  /// `capacity` bounds the number of unacked packets in flight. It must not
  /// exceed the sequence space or live entries from different laps would
  /// collide.
  pub fn new(capacity: usize, sequencer: &Sequencer) -> Self {
    let capacity = capacity.min(1usize << sequencer.bits());
    Self { pending: seq::Buffer::new(capacity), capacity, in_flight: 0 }
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight
  }

  /// Whether the slot for `sequence` is free. A live entry from a previous
  /// lap of the sequence space keeps its slot until acked.
  pub fn will_accept(&self, sequence: Seq) -> bool {
    self.pending.get(sequence).is_none()
  }

  pub fn has_room(&self, packets: usize) -> bool {
    // conservative: the table may still reject a specific sequence whose slot
    // holds an older live entry, `track` reports that as WindowFull
    self.in_flight + packets <= self.capacity
  }

  /// Record a packet that was just transmitted for the first time.
  pub fn track(
    &mut self,
    sequence: Seq,
    kind: PendingKind,
    payload: Vec<u8>,
    now: Instant,
  ) -> Result<(), WindowFull> {
    let entry = Pending { kind, payload, last_sent: now, attempts: 0 };
    match self.pending.insert(sequence, entry) {
      Ok(()) => {
        self.in_flight += 1;
        Ok(())
      }
      Err(_) => Err(WindowFull),
    }
  }

  /// Mark `sequence` acknowledged. Idempotent: acking an absent entry is a
  /// no-op. Returns the removed entry so the caller can take an RTT sample
  /// and recycle the payload buffer.
  pub fn ack(&mut self, sequence: Seq) -> Option<Pending> {
    let entry = self.pending.remove(sequence);
    if entry.is_some() {
      self.in_flight -= 1;
    }
    entry
  }

  /// Retransmit every entry that has waited at least `interval`, via
  /// `resend(sequence, entry)`. Returns `Exhausted` if any entry exceeded
  /// `max_attempts`; the connection must treat that as a timeout.
  pub fn update(
    &mut self,
    now: Instant,
    interval: Duration,
    max_attempts: u32,
    mut resend: impl FnMut(Seq, &Pending),
  ) -> Result<(), Exhausted> {
    for (sequence, entry) in self.pending.iter_mut() {
      if now.duration_since(entry.last_sent) < interval {
        continue;
      }
      if entry.attempts >= max_attempts {
        return Err(Exhausted { sequence, attempts: entry.attempts });
      }
      entry.attempts += 1;
      entry.last_sent = now;
      resend(sequence, entry);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn sender(bits: u32, capacity: usize) -> (ReliableSender, Sequencer) {
    let sequencer = Sequencer::new(bits);
    (ReliableSender::new(capacity, &sequencer), sequencer)
  }

  #[test]
  fn ack_removes_and_is_idempotent() {
    let (mut sender, mut sequencer) = sender(16, 64);
    let now = Instant::now();
    let seq = sequencer.next();
    sender.track(seq, PendingKind::Reliable, b"a".to_vec(), now).unwrap();
    assert_eq!(sender.in_flight(), 1);
    assert!(sender.ack(seq).is_some());
    assert_eq!(sender.in_flight(), 0);
    // late duplicate ack
    assert!(sender.ack(seq).is_none());
    assert_eq!(sender.in_flight(), 0);
  }

  #[test]
  fn resends_after_interval_until_exhausted() {
    let (mut sender, mut sequencer) = sender(16, 64);
    let interval = Duration::from_millis(100);
    let mut now = Instant::now();
    let seq = sequencer.next();
    sender.track(seq, PendingKind::Reliable, b"payload".to_vec(), now).unwrap();

    let mut resends = 0;
    // not due yet
    sender.update(now, interval, 5, |_, _| resends += 1).unwrap();
    assert_eq!(resends, 0);

    // exactly max_attempts retransmissions, then exhaustion
    for _ in 0..5 {
      now += interval;
      sender.update(now, interval, 5, |_, _| resends += 1).unwrap();
    }
    assert_eq!(resends, 5);

    now += interval;
    let err = sender.update(now, interval, 5, |_, _| resends += 1).unwrap_err();
    assert_eq!(err, Exhausted { sequence: seq, attempts: 5 });
    assert_eq!(resends, 5);
  }

  #[test]
  fn window_full_when_capacity_reached() {
    let (mut sender, mut sequencer) = sender(16, 4);
    let now = Instant::now();
    for _ in 0..4 {
      let seq = sequencer.next();
      sender.track(seq, PendingKind::Reliable, vec![], now).unwrap();
    }
    assert!(!sender.has_room(1));
    // sequence 4 maps onto slot 0, still occupied by live sequence 0
    assert_eq!(
      sender.track(sequencer.next(), PendingKind::Reliable, vec![], now),
      Err(WindowFull)
    );
  }

  #[test]
  fn survives_sequence_wraparound() {
    // 8-bit sequence space, 300 packets back to back with immediate acks
    let (mut sender, mut sequencer) = sender(8, 64);
    let now = Instant::now();
    for i in 0..300u32 {
      let seq = sequencer.next();
      sender.track(seq, PendingKind::Reliable, vec![i as u8], now).unwrap();
      let entry = sender.ack(seq).expect("entry must exist");
      assert_eq!(entry.payload, vec![i as u8]);
    }
    assert_eq!(sender.in_flight(), 0);
  }
}
