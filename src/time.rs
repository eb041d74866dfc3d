use std::time::Instant;

/// Monotonic time source.
///
/// The peer reads the clock once per update pass and threads the value through
/// every subsystem, so swapping in a fake clock makes timeouts, resends and
/// keep-alives fully deterministic in tests.
pub trait Clock {
  fn now(&self) -> Instant;
}

/// The default clock, backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// N-observation exponential moving average with variance.
///
/// Roughly equivalent to averaging the last `n` samples:
/// <https://en.wikipedia.org/wiki/Moving_average#Exponential_moving_average>
#[derive(Debug, Clone)]
pub struct MovingAverage {
  alpha: f64,
  value: f64,
  variance: f64,
  initialized: bool,
}

impl MovingAverage {
  pub fn new(n: u32) -> Self {
    Self {
      alpha: 2.0 / (n as f64 + 1.0),
      value: 0.0,
      variance: 0.0,
      initialized: false,
    }
  }

  pub fn add(&mut self, sample: f64) {
    if self.initialized {
      let delta = sample - self.value;
      self.value += self.alpha * delta;
      self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * delta * delta);
    } else {
      self.value = sample;
      self.initialized = true;
    }
  }

  pub fn value(&self) -> f64 {
    self.value
  }

  pub fn variance(&self) -> f64 {
    self.variance
  }

  pub fn reset(&mut self) {
    self.value = 0.0;
    self.variance = 0.0;
    self.initialized = false;
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::{cell::Cell, rc::Rc, time::Duration};

  /// Manually advanced clock for deterministic tests.
  #[derive(Clone)]
  pub struct ManualClock {
    base: Instant,
    offset: Rc<Cell<Duration>>,
  }

  impl ManualClock {
    pub fn new() -> Self {
      Self { base: Instant::now(), offset: Rc::new(Cell::new(Duration::ZERO)) }
    }

    pub fn advance(&self, by: Duration) {
      self.offset.set(self.offset.get() + by);
    }
  }

  impl Clock for ManualClock {
    fn now(&self) -> Instant {
      self.base + self.offset.get()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn first_sample_is_taken_verbatim() {
    let mut avg = MovingAverage::new(10);
    avg.add(42.0);
    assert_eq!(avg.value(), 42.0);
    assert_eq!(avg.variance(), 0.0);
  }

  #[test]
  fn converges_towards_constant_input() {
    let mut avg = MovingAverage::new(4);
    avg.add(100.0);
    for _ in 0..64 {
      avg.add(10.0);
    }
    assert!((avg.value() - 10.0).abs() < 1e-6);
  }

  #[test]
  fn reset_clears_state() {
    let mut avg = MovingAverage::new(4);
    avg.add(5.0);
    avg.add(7.0);
    avg.reset();
    avg.add(1.0);
    assert_eq!(avg.value(), 1.0);
  }

  #[test]
  fn manual_clock_advances() {
    use std::time::Duration;
    let clock = testing::ManualClock::new();
    let start = clock.now();
    clock.advance(Duration::from_secs(3));
    assert_eq!(clock.now() - start, Duration::from_secs(3));
  }
}
