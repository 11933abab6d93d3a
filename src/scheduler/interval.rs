use std::time::Duration;

/// Bounded exponential refresh interval.
///
/// Starts at `min`. A cycle with transient source errors doubles the interval,
/// a clean cycle halves it; the result is always clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveInterval {
  min: Duration,
  max: Duration,
  current: Duration,
}

impl AdaptiveInterval {
  pub fn new(min: Duration, max: Duration) -> Self {
    let max = max.max(min);
    Self {
      min,
      max,
      current: min,
    }
  }

  pub fn current(&self) -> Duration {
    self.current
  }

  pub fn min(&self) -> Duration {
    self.min
  }

  pub fn max(&self) -> Duration {
    self.max
  }

  /// Adjust after a cycle and return the next interval.
  pub fn record(&mut self, had_transient_errors: bool) -> Duration {
    let next = if had_transient_errors {
      self.current.saturating_mul(2)
    } else {
      self.current / 2
    };
    self.current = next.clamp(self.min, self.max);
    self.current
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
  }

  #[test]
  fn test_backs_off_then_recovers() {
    let mut interval = AdaptiveInterval::new(secs(1), secs(60));
    assert_eq!(interval.current(), secs(1));

    let backoff: Vec<_> = (0..8).map(|_| interval.record(true)).collect();
    assert_eq!(
      backoff,
      vec![secs(2), secs(4), secs(8), secs(16), secs(32), secs(60), secs(60), secs(60)]
    );

    assert_eq!(interval.record(false), secs(30));
    assert_eq!(interval.record(false), secs(15));
    for _ in 0..10 {
      interval.record(false);
    }
    assert_eq!(interval.current(), secs(1));
  }

  #[test]
  fn test_always_within_bounds() {
    let mut interval = AdaptiveInterval::new(secs(7), secs(50));
    // Arbitrary but fixed mix of outcomes
    let pattern = [true, true, false, true, true, true, true, false, false, true, false];
    for transient in pattern.iter().cycle().take(200) {
      let next = interval.record(*transient);
      assert!(next >= secs(7) && next <= secs(50));
    }
  }

  #[test]
  fn test_max_below_min_collapses_to_min() {
    let mut interval = AdaptiveInterval::new(secs(10), secs(5));
    assert_eq!(interval.record(true), secs(10));
  }
}
