//! Wrapping sequence-number arithmetic and sequence-indexed storage.
//!
//! Sequence numbers live in a configurable bit width (4..=16). Comparisons use
//! signed distance, so "newer" stays well-defined across the wrap boundary.

/// Wire representation of a sequence number. The arithmetic window may be
/// narrower than 16 bits, see [`Sequencer`].
pub type Seq = u16;

/// Signed distance from `b` to `a` modulo `2^bits`.
///
/// Positive means `a` is newer than `b`. The result is in
/// `-(2^(bits-1)) ..= 2^(bits-1) - 1`.
#[inline]
pub fn distance(bits: u32, a: Seq, b: Seq) -> i32 {
  debug_assert!((4..=16).contains(&bits));
  let mask = wrap_mask(bits);
  let d = (a.wrapping_sub(b)) & mask;
  let half = 1u16 << (bits - 1);
  if d >= half {
    d as i32 - (1i32 << bits)
  } else {
    d as i32
  }
}

/// `a - n` modulo `2^bits`.
#[inline]
pub fn sub(bits: u32, a: Seq, n: u16) -> Seq {
  a.wrapping_sub(n) & wrap_mask(bits)
}

#[inline]
fn wrap_mask(bits: u32) -> u16 {
  if bits == 16 {
    u16::MAX
  } else {
    (1u16 << bits) - 1
  }
}

/// Hands out consecutive sequence numbers, wrapping at the configured width.
#[derive(Debug, Clone)]
pub struct Sequencer {
  bits: u32,
  next: Seq,
}

impl Sequencer {
  pub fn new(bits: u32) -> Self {
    assert!((4..=16).contains(&bits), "sequence width out of range");
    Self { bits, next: 0 }
  }

  pub fn bits(&self) -> u32 {
    self.bits
  }

  pub fn next(&mut self) -> Seq {
    let seq = self.next;
    self.next = self.next.wrapping_add(1) & wrap_mask(self.bits);
    seq
  }

  pub fn peek(&self) -> Seq {
    self.next
  }

  /// Signed distance from `b` to `a` within this sequencer's width.
  #[inline]
  pub fn distance(&self, a: Seq, b: Seq) -> i32 {
    distance(self.bits, a, b)
  }
}

/// Fixed-size storage indexed by `sequence % capacity`.
///
/// A slot only yields its item while the stored sequence matches, so stale
/// entries from a previous lap of the sequence space are never confused with
/// current ones.
#[derive(Debug)]
pub struct Buffer<T> {
  slots: Vec<Option<(Seq, T)>>,
}

impl<T> Buffer<T> {
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0);
    let mut slots = Vec::new();
    slots.resize_with(capacity, || None);
    Self { slots }
  }

  #[inline]
  fn index(&self, sequence: Seq) -> usize {
    sequence as usize % self.slots.len()
  }

  /// Store `item` under `sequence`. Fails if the slot is occupied by a
  /// *different* live sequence, which means the window has overrun.
  pub fn insert(&mut self, sequence: Seq, item: T) -> Result<(), T> {
    let index = self.index(sequence);
    match &self.slots[index] {
      Some((existing, _)) if *existing != sequence => Err(item),
      _ => {
        self.slots[index] = Some((sequence, item));
        Ok(())
      }
    }
  }

  pub fn get(&self, sequence: Seq) -> Option<&T> {
    match &self.slots[self.index(sequence)] {
      Some((stored, item)) if *stored == sequence => Some(item),
      _ => None,
    }
  }

  pub fn get_mut(&mut self, sequence: Seq) -> Option<&mut T> {
    let index = self.index(sequence);
    match &mut self.slots[index] {
      Some((stored, item)) if *stored == sequence => Some(item),
      _ => None,
    }
  }

  /// Remove and return the item stored under `sequence`, if any.
  /// Removing an absent sequence is a no-op.
  pub fn remove(&mut self, sequence: Seq) -> Option<T> {
    let index = self.index(sequence);
    match &self.slots[index] {
      Some((stored, _)) if *stored == sequence => self.slots[index].take().map(|(_, item)| item),
      _ => None,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.slots.iter().all(|s| s.is_none())
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = (Seq, &mut T)> {
    self.slots.iter_mut().filter_map(|slot| slot.as_mut().map(|(seq, item)| (*seq, item)))
  }
}
