use std::{
  ops::{Add, Sub},
  time::SystemTime,
};

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};

use crate::structure::duration::Duration;

/// RTPS Time_t: seconds since the Unix epoch plus 2^-32 second fractions.
#[derive(
  Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Readable,
  Writable,
)]
pub struct Timestamp {
  seconds: u32,
  fraction: u32,
}

impl Timestamp {
  pub const ZERO: Self = Self {
    seconds: 0,
    fraction: 0,
  };
  pub const INVALID: Self = Self {
    seconds: 0xffff_ffff,
    fraction: 0xffff_ffff,
  };
  pub const INFINITE: Self = Self {
    seconds: 0x7fff_ffff,
    fraction: 0xffff_ffff,
  };

  pub fn now() -> Self {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
      Ok(elapsed) => Self {
        seconds: elapsed.as_secs() as u32,
        fraction: ((elapsed.subsec_nanos() as u64 * (1u64 << 32)) / 1_000_000_000) as u32,
      },
      // Clock before epoch. Not a protocol error, just a broken clock.
      Err(_) => Self::ZERO,
    }
  }

  pub const fn new(seconds: u32, fraction: u32) -> Self {
    Self { seconds, fraction }
  }

  pub const fn seconds(&self) -> u32 {
    self.seconds
  }

  fn to_ticks(self) -> u64 {
    ((self.seconds as u64) << 32) | (self.fraction as u64)
  }

  fn from_ticks(ticks: u64) -> Self {
    Self {
      seconds: (ticks >> 32) as u32,
      fraction: (ticks & 0xffff_ffff) as u32,
    }
  }

  /// Saturating difference, zero when `other` is later.
  pub fn duration_since(&self, other: Timestamp) -> Duration {
    Duration::from_ticks(self.to_ticks().saturating_sub(other.to_ticks()) as i64)
  }
}

impl Add<Duration> for Timestamp {
  type Output = Self;
  fn add(self, d: Duration) -> Self {
    if d.is_infinite() {
      Self::INFINITE
    } else {
      Self::from_ticks(self.to_ticks().saturating_add(d.to_ticks() as u64))
    }
  }
}

impl Sub<Duration> for Timestamp {
  type Output = Self;
  fn sub(self, d: Duration) -> Self {
    Self::from_ticks(self.to_ticks().saturating_sub(d.to_ticks() as u64))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_then_subtract_returns_start() {
    let t = Timestamp::new(100, 0);
    let d = Duration::from_millis(250);
    assert_eq!((t + d) - d, t);
  }

  #[test]
  fn infinite_duration_pins_to_infinite_timestamp() {
    assert_eq!(Timestamp::new(5, 5) + Duration::INFINITE, Timestamp::INFINITE);
  }

  #[test]
  fn duration_since_is_saturating() {
    let early = Timestamp::new(10, 0);
    let late = Timestamp::new(20, 0);
    assert_eq!(early.duration_since(late), Duration::ZERO);
    assert_eq!(late.duration_since(early), Duration::from_secs(10));
  }
}
