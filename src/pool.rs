//! Bounded pool of reusable send buffers.
//!
//! Owned by the peer and passed down into every send path, so there is no
//! process-global buffer state. `take` hands out an empty buffer with packet
//! capacity; `put` returns it unless the pool is already full, in which case
//! the buffer is simply dropped.

pub struct BufferPool {
  free: Vec<Vec<u8>>,
  buffer_capacity: usize,
  max_free: usize,
}

impl BufferPool {
  pub fn new(buffer_capacity: usize, max_free: usize) -> Self {
    Self { free: Vec::with_capacity(max_free), buffer_capacity, max_free }
  }

  pub fn take(&mut self) -> Vec<u8> {
    match self.free.pop() {
      Some(mut buffer) => {
        buffer.clear();
        buffer
      }
      None => Vec::with_capacity(self.buffer_capacity),
    }
  }

  pub fn put(&mut self, buffer: Vec<u8>) {
    if self.free.len() < self.max_free {
      self.free.push(buffer);
    }
  }

  pub fn available(&self) -> usize {
    self.free.len()
  }
}
