//! Rescheduling one-shot timers.
//!
//! A `TimedEvent` fires at most once per arming; whoever handles the fire
//! decides whether to arm it again. Time is passed in explicitly, so the
//! timer thread drives these with the real clock and tests drive them with
//! a synthetic one.

use crate::structure::{duration::Duration, time::Timestamp};

#[derive(Debug)]
pub struct TimedEvent {
  interval: Duration,
  next_fire: Option<Timestamp>,
}

impl TimedEvent {
  /// Created cancelled; arm with `restart`.
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      next_fire: None,
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Changes the firing interval. An INFINITE interval cancels the timer;
  /// otherwise an armed timer keeps its current schedule and the new
  /// interval applies from the next restart.
  pub fn update_interval(&mut self, interval: Duration) {
    self.interval = interval;
    if interval.is_infinite() {
      self.cancel();
    }
  }

  /// Arms the timer to fire `interval` from `now`. With an INFINITE
  /// interval the timer stays cancelled.
  pub fn restart(&mut self, now: Timestamp) {
    if self.interval.is_infinite() {
      self.next_fire = None;
    } else {
      self.next_fire = Some(now + self.interval);
    }
  }

  /// Arms the timer to fire at an absolute instant.
  pub fn restart_at(&mut self, at: Timestamp) {
    self.next_fire = Some(at);
  }

  /// Idempotent.
  pub fn cancel(&mut self) {
    self.next_fire = None;
  }

  pub fn is_armed(&self) -> bool {
    self.next_fire.is_some()
  }

  pub fn next_fire_time(&self) -> Option<Timestamp> {
    self.next_fire
  }

  /// Disarms and reports true when the deadline has passed. Single fire
  /// per round: a second call without a restart returns false.
  pub fn fire_if_due(&mut self, now: Timestamp) -> bool {
    match self.next_fire {
      Some(at) if at <= now => {
        self.next_fire = None;
        true
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn t(seconds: u32) -> Timestamp {
    Timestamp::new(seconds, 0)
  }

  #[test]
  fn fires_once_per_arming() {
    let mut ev = TimedEvent::new(Duration::from_secs(5));
    ev.restart(t(0));
    assert!(!ev.fire_if_due(t(4)));
    assert!(ev.fire_if_due(t(5)));
    // single fire per round
    assert!(!ev.fire_if_due(t(100)));
  }

  #[test]
  fn infinite_interval_keeps_timer_cancelled() {
    let mut ev = TimedEvent::new(Duration::INFINITE);
    ev.restart(t(0));
    assert!(!ev.is_armed());

    let mut ev = TimedEvent::new(Duration::from_secs(1));
    ev.restart(t(0));
    ev.update_interval(Duration::INFINITE);
    assert!(!ev.is_armed());
  }

  #[test]
  fn cancel_is_idempotent() {
    let mut ev = TimedEvent::new(Duration::from_secs(1));
    ev.restart(t(0));
    ev.cancel();
    ev.cancel();
    assert!(!ev.fire_if_due(t(10)));
  }

  #[test]
  fn restart_at_sets_absolute_deadline() {
    let mut ev = TimedEvent::new(Duration::from_secs(1));
    ev.restart_at(t(42));
    assert!(!ev.fire_if_due(t(41)));
    assert!(ev.fire_if_due(t(42)));
  }
}
