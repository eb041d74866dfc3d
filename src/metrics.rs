//! Observability: a fixed ring of per-tick samples plus running counters for
//! the transient conditions the receive path silently drops. Not required for
//! correctness; the peer writes, embedders read.

/// Counts for one update tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSample {
  pub tick: u64,
  pub packets_sent: u32,
  pub packets_received: u32,
  pub bytes_sent: u64,
  pub bytes_received: u64,
  pub connections: u32,
}

/// Running totals of dropped / anomalous input since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
  /// Datagrams that failed to decode.
  pub malformed: u64,
  /// Datagrams from endpoints with no connection that were not valid
  /// connect requests.
  pub unknown_endpoint: u64,
  /// Data packets suppressed as duplicates.
  pub duplicates: u64,
  /// Data packets older than the ack window.
  pub stale: u64,
  /// Partial fragmented messages dropped by the reassembly timeout.
  pub purged_fragments: u64,
  /// Connect requests refused (capacity, policy or protocol mismatch).
  pub rejected_connects: u64,
}

pub struct Metrics {
  ring: Vec<TickSample>,
  tick: u64,
  pub counters: Counters,
}

impl Metrics {
  pub fn new(window: usize) -> Self {
    assert!(window > 0);
    Self { ring: vec![TickSample::default(); window], tick: 0, counters: Counters::default() }
  }

  #[inline]
  fn slot(&mut self) -> &mut TickSample {
    let index = (self.tick % self.ring.len() as u64) as usize;
    &mut self.ring[index]
  }

  pub fn on_send(&mut self, bytes: usize) {
    let slot = self.slot();
    slot.packets_sent += 1;
    slot.bytes_sent += bytes as u64;
  }

  pub fn on_receive(&mut self, bytes: usize) {
    let slot = self.slot();
    slot.packets_received += 1;
    slot.bytes_received += bytes as u64;
  }

  /// Close out the current tick and advance the ring. The next slot is
  /// overwritten, old data falls off after `window` ticks.
  pub fn end_tick(&mut self, connections: usize) {
    let tick = self.tick;
    let slot = self.slot();
    slot.tick = tick;
    slot.connections = connections as u32;
    self.tick += 1;
    let next = self.slot();
    *next = TickSample::default();
  }

  /// The most recently completed tick, if any.
  pub fn latest(&self) -> Option<&TickSample> {
    if self.tick == 0 {
      return None;
    }
    self.get(self.tick - 1)
  }

  /// Sample for `tick`, if it is still inside the ring window.
  pub fn get(&self, tick: u64) -> Option<&TickSample> {
    let window = self.ring.len() as u64;
    if tick >= self.tick || self.tick - tick > window {
      return None;
    }
    let sample = &self.ring[(tick % window) as usize];
    // the slot may already have been overwritten by a newer lap
    (sample.tick == tick).then_some(sample)
  }

  pub fn current_tick(&self) -> u64 {
    self.tick
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn samples_accumulate_within_a_tick() {
    let mut metrics = Metrics::new(8);
    metrics.on_send(100);
    metrics.on_send(50);
    metrics.on_receive(10);
    metrics.end_tick(3);

    let sample = metrics.latest().unwrap();
    assert_eq!(sample.packets_sent, 2);
    assert_eq!(sample.bytes_sent, 150);
    assert_eq!(sample.packets_received, 1);
    assert_eq!(sample.bytes_received, 10);
    assert_eq!(sample.connections, 3);
  }

  #[test]
  fn ring_overwrites_on_wraparound() {
    let mut metrics = Metrics::new(4);
    for i in 0..6 {
      metrics.on_send(i * 10);
      metrics.end_tick(1);
    }
    // old ticks have fallen off (the upcoming tick's slot is already cleared)
    assert_eq!(metrics.get(0), None);
    assert_eq!(metrics.get(1), None);
    assert_eq!(metrics.get(2), None);
    assert_eq!(metrics.get(3).unwrap().bytes_sent, 30);
    assert_eq!(metrics.get(5).unwrap().bytes_sent, 50);
    // future ticks do not exist yet
    assert_eq!(metrics.get(6), None);
  }

  #[test]
  fn no_latest_before_first_tick() {
    let metrics = Metrics::new(4);
    assert!(metrics.latest().is_none());
  }
}
