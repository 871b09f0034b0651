use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};

/// RTPS Duration_t: signed seconds and 2^-32 second fractions.
///
/// The all-ones pattern is the RTPS "infinite" sentinel. An infinite
/// period disables whatever timer it configures.
#[derive(
  Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Readable,
  Writable,
)]
pub struct Duration {
  seconds: i32,
  fraction: u32,
}

impl Duration {
  pub const ZERO: Self = Self {
    seconds: 0,
    fraction: 0,
  };
  pub const INFINITE: Self = Self {
    seconds: 0x7fff_ffff,
    fraction: 0xffff_ffff,
  };

  pub const fn new(seconds: i32, fraction: u32) -> Self {
    Self { seconds, fraction }
  }

  pub const fn from_secs(secs: i32) -> Self {
    Self {
      seconds: secs,
      fraction: 0,
    }
  }

  pub const fn from_millis(millis: i64) -> Self {
    Self {
      seconds: (millis / 1000) as i32,
      // 2^32 / 10^3 fractions per millisecond
      fraction: ((millis % 1000) * 4_294_967) as u32,
    }
  }

  pub fn from_nanos(nanos: i64) -> Self {
    Self {
      seconds: (nanos / 1_000_000_000) as i32,
      fraction: (((nanos % 1_000_000_000) as u64 * (1u64 << 32)) / 1_000_000_000) as u32,
    }
  }

  pub const fn is_infinite(&self) -> bool {
    self.seconds == Self::INFINITE.seconds && self.fraction == Self::INFINITE.fraction
  }

  pub const fn seconds(&self) -> i32 {
    self.seconds
  }

  pub const fn fraction(&self) -> u32 {
    self.fraction
  }

  /// Whole duration in 2^-32 second ticks.
  pub(crate) fn to_ticks(self) -> i64 {
    ((self.seconds as i64) << 32) | (self.fraction as i64)
  }

  pub(crate) fn from_ticks(ticks: i64) -> Self {
    Self {
      seconds: (ticks >> 32) as i32,
      fraction: (ticks & 0xffff_ffff) as u32,
    }
  }
}

impl From<std::time::Duration> for Duration {
  fn from(d: std::time::Duration) -> Self {
    Self {
      seconds: d.as_secs() as i32,
      fraction: ((d.subsec_nanos() as u64 * (1u64 << 32)) / 1_000_000_000) as u32,
    }
  }
}

impl Add for Duration {
  type Output = Self;
  fn add(self, other: Self) -> Self {
    if self.is_infinite() || other.is_infinite() {
      Self::INFINITE
    } else {
      Self::from_ticks(self.to_ticks() + other.to_ticks())
    }
  }
}

impl Mul<i64> for Duration {
  type Output = Self;
  fn mul(self, rhs: i64) -> Self {
    if self.is_infinite() {
      self
    } else {
      Self::from_ticks(self.to_ticks() * rhs)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn millis_roundtrip_is_close() {
    let d = Duration::from_millis(1500);
    assert_eq!(d.seconds(), 1);
    // fraction ~ half of 2^32
    assert!((d.fraction() as i64 - (1i64 << 31)).abs() < 5_000);
  }

  #[test]
  fn infinite_is_sticky_under_addition() {
    assert!((Duration::INFINITE + Duration::from_secs(1)).is_infinite());
  }
}
