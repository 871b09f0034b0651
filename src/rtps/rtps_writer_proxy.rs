//! Reader-side state machine tracking one remote writer.
//!
//! For every sequence number above the delivered prefix the proxy keeps a
//! status. UNKNOWN and MISSING are deliberately merged: both mean "ask for
//! it in the next ACKNACK". RECEIVED covers both real samples and samples a
//! GAP declared irrelevant; once the prefix of RECEIVED numbers is
//! contiguous it is folded into `changes_from_writer_low_mark` and the
//! entries are dropped.

use std::collections::BTreeMap;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  rtps::{fragment_assembler::FragmentAssembler, timed_event::TimedEvent},
  structure::{
    duration::Duration,
    guid::GUID,
    sequence_number::{SequenceNumber, SequenceNumberSet},
    time::Timestamp,
  },
};

/// Tracked status of one sequence number. Missing covers the RTPS UNKNOWN
/// and MISSING states; Received covers received and irrelevant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChangeFromWriter {
  Missing,
  Received,
}

/// A GAP whose start lies more than this far past the delivered prefix is
/// ignored wholesale; matches the 256-bit on-wire bitmap so a hostile
/// writer cannot force unbounded tracking state.
const GAP_START_WINDOW: i64 = 255;
/// Individual gap-listed numbers are accepted slightly further out, to the
/// end of the bitmap window.
const GAP_SET_WINDOW: i64 = 256;

/// What a HEARTBEAT did to the proxy.
#[derive(Debug, PartialEq, Eq)]
pub struct HeartbeatOutcome {
  /// Samples promoted to LOST: they were never received and the writer no
  /// longer has them.
  pub samples_lost: u32,
  /// The heartbeat asks for (or missing samples require) an ACKNACK; the
  /// response timer has been armed.
  pub acknack_timer_armed: bool,
  /// The liveliness flag was set; the reader should assert the writer
  /// alive.
  pub liveliness_asserted: bool,
}

pub struct RtpsWriterProxy {
  pub remote_writer_guid: GUID,
  /// Ownership strength from discovery, for EXCLUSIVE arbitration.
  pub ownership_strength: i32,

  changes_from_writer: BTreeMap<SequenceNumber, ChangeFromWriter>,
  /// Everything at or below this is RECEIVED or irrelevant, with no holes.
  changes_from_writer_low_mark: SequenceNumber,
  last_heartbeat_count: i32,

  /// Fires once shortly after discovery to solicit a HEARTBEAT.
  pub initial_acknack: TimedEvent,
  /// Delays ACKNACK responses so answers to heartbeat bursts coalesce.
  pub heartbeat_response: TimedEvent,

  /// Reassembly state for DATA_FRAG from this writer.
  pub(crate) fragment_assembler: Option<FragmentAssembler>,
}

impl RtpsWriterProxy {
  pub fn new(
    remote_writer_guid: GUID,
    initial_acknack_delay: Duration,
    heartbeat_response_delay: Duration,
  ) -> Self {
    Self {
      remote_writer_guid,
      ownership_strength: 0,
      changes_from_writer: BTreeMap::new(),
      changes_from_writer_low_mark: SequenceNumber::ZERO,
      last_heartbeat_count: 0,
      initial_acknack: TimedEvent::new(initial_acknack_delay),
      heartbeat_response: TimedEvent::new(heartbeat_response_delay),
      fragment_assembler: None,
    }
  }

  /// Called when the writer is matched: arms the initial-ACKNACK timer.
  pub fn start(&mut self, now: Timestamp) {
    self.initial_acknack.restart(now);
  }

  /// Called before the proxy is destroyed on writer undiscovery.
  pub fn stop(&mut self) {
    self.initial_acknack.cancel();
    self.heartbeat_response.cancel();
  }

  // ---- queries ---------------------------------------------------------

  /// Highest sequence number of the contiguous delivered/irrelevant
  /// prefix.
  pub fn available_changes_max(&self) -> SequenceNumber {
    self.changes_from_writer_low_mark
  }

  pub fn number_of_changes_from_writer(&self) -> usize {
    self.changes_from_writer.len()
  }

  pub fn are_there_missing_changes(&self) -> bool {
    self
      .changes_from_writer
      .values()
      .any(|s| *s == ChangeFromWriter::Missing)
  }

  /// How many samples below `limit` are still unresolved. Monotone
  /// non-decreasing in `limit`.
  pub fn unknown_missing_changes_up_to(&self, limit: SequenceNumber) -> usize {
    self
      .changes_from_writer
      .range(..limit)
      .filter(|(_, s)| **s == ChangeFromWriter::Missing)
      .count()
  }

  /// The ACKNACK window: base is the first undelivered number, bits are
  /// the unresolved ones that fit the wire bitmap.
  pub fn missing_changes(&self) -> SequenceNumberSet {
    let mut set = SequenceNumberSet::new(self.changes_from_writer_low_mark + 1);
    for (sn, status) in &self.changes_from_writer {
      if *status == ChangeFromWriter::Missing && !set.add(*sn) {
        break; // past the 256-bit window
      }
    }
    set
  }

  // ---- state transitions ----------------------------------------------

  /// Records a received DATA. Numbers between the delivered prefix and
  /// `sn` that were never heard of become MISSING. Returns false for
  /// duplicates (already received or already delivered).
  pub fn received_change_set(&mut self, sn: SequenceNumber) -> bool {
    if sn <= self.changes_from_writer_low_mark
      || self.changes_from_writer.get(&sn) == Some(&ChangeFromWriter::Received)
    {
      trace!("received_change_set: duplicate {sn:?}");
      return false;
    }
    self.mark_received(sn);
    true
  }

  /// Records one irrelevant (gapped) sequence number. Same bookkeeping as
  /// a reception, there just is no sample to deliver.
  fn irrelevant_change_set(&mut self, sn: SequenceNumber) -> bool {
    if sn <= self.changes_from_writer_low_mark
      || self.changes_from_writer.get(&sn) == Some(&ChangeFromWriter::Received)
    {
      return false;
    }
    self.mark_received(sn);
    true
  }

  fn mark_received(&mut self, sn: SequenceNumber) {
    let mut fill = self.changes_from_writer_low_mark + 1;
    while fill < sn {
      self.changes_from_writer.entry(fill).or_insert(ChangeFromWriter::Missing);
      fill += 1;
    }
    self.changes_from_writer.insert(sn, ChangeFromWriter::Received);
    self.fold_received_prefix();
  }

  /// Advances the low mark over a contiguous RECEIVED prefix and drops
  /// those entries.
  fn fold_received_prefix(&mut self) {
    while let Some((&first, &status)) = self.changes_from_writer.first_key_value() {
      if first == self.changes_from_writer_low_mark + 1 && status == ChangeFromWriter::Received {
        self.changes_from_writer.pop_first();
        self.changes_from_writer_low_mark = first;
      } else {
        break;
      }
    }
  }

  /// HEARTBEAT(first_sn): everything below the writer's first available
  /// number can never arrive. Unresolved entries below it are promoted to
  /// LOST (counted in the return value) and the prefix advances.
  ///
  /// A proxy that has never tracked anything does not count the writer's
  /// pre-existing history start as lost samples; the samples predate the
  /// match.
  pub fn lost_changes_update(&mut self, first_sn: SequenceNumber) -> u32 {
    if first_sn <= self.changes_from_writer_low_mark + 1 {
      return 0;
    }

    let fresh_proxy = self.changes_from_writer.is_empty()
      && self.changes_from_writer_low_mark == SequenceNumber::ZERO;

    let mut lost_tracked: u32 = 0;
    let mut tracked_below: i64 = 0;
    for (_, status) in self.changes_from_writer.range(..first_sn) {
      tracked_below += 1;
      if *status == ChangeFromWriter::Missing {
        lost_tracked += 1;
      }
    }
    let untracked_below =
      (first_sn - self.changes_from_writer_low_mark - 1) - tracked_below;

    self.changes_from_writer = self.changes_from_writer.split_off(&first_sn);
    self.changes_from_writer_low_mark = first_sn - 1;
    self.fold_received_prefix();

    if fresh_proxy {
      0
    } else {
      lost_tracked + untracked_below as u32
    }
  }

  /// HEARTBEAT(last_sn): everything up to the writer's last available
  /// number exists; unheard-of numbers become MISSING.
  pub fn missing_changes_update(&mut self, last_sn: SequenceNumber) {
    let mut sn = self.changes_from_writer_low_mark + 1;
    while sn <= last_sn {
      self.changes_from_writer.entry(sn).or_insert(ChangeFromWriter::Missing);
      sn += 1;
    }
  }

  /// Full HEARTBEAT processing. Returns None when the count is stale; the
  /// event is swallowed without touching any state.
  #[allow(clippy::too_many_arguments)]
  pub fn process_heartbeat(
    &mut self,
    count: i32,
    first_sn: SequenceNumber,
    last_sn: SequenceNumber,
    final_flag: bool,
    liveliness_flag: bool,
    now: Timestamp,
  ) -> Option<HeartbeatOutcome> {
    if count <= self.last_heartbeat_count {
      debug!(
        "Stale HEARTBEAT count {count} (last {}) from {:?}",
        self.last_heartbeat_count, self.remote_writer_guid
      );
      return None;
    }
    self.last_heartbeat_count = count;

    let samples_lost = if first_sn > last_sn + 1 {
      // Writer that never had samples, or a malformed range. Accepted for
      // the count update, but it advances nothing.
      0
    } else {
      let lost = self.lost_changes_update(first_sn);
      if last_sn >= first_sn {
        self.missing_changes_update(last_sn);
      }
      lost
    };

    // Liveliness and the final flag are handled independently: the final
    // flag alone decides whether an ACKNACK response is due.
    let acknack_timer_armed = !final_flag || self.are_there_missing_changes();
    if acknack_timer_armed {
      self.heartbeat_response.restart(now);
    }

    Some(HeartbeatOutcome {
      samples_lost,
      acknack_timer_armed,
      liveliness_asserted: liveliness_flag,
    })
  }

  /// GAP processing: the contiguous range `[gap_start, gap_list.base)` and
  /// the listed numbers become irrelevant.
  ///
  /// Anti-DoS windows, both anchored at the delivered prefix: a gap
  /// starting beyond `low_mark + 255` is ignored entirely, and listed
  /// numbers beyond `low_mark + 256` are skipped, tracking the low mark as
  /// it advances. Partial fragment reassemblies of gapped numbers are
  /// aborted.
  pub fn process_gap(&mut self, gap_start: SequenceNumber, gap_list: &SequenceNumberSet) {
    if gap_start - self.changes_from_writer_low_mark > GAP_START_WINDOW {
      debug!(
        "Ignoring GAP starting at {gap_start:?}, too far past low mark {:?}",
        self.changes_from_writer_low_mark
      );
      return;
    }

    let mut newly_irrelevant: Vec<SequenceNumber> = Vec::new();

    let mut sn = gap_start;
    while sn < gap_list.base() {
      if sn - self.changes_from_writer_low_mark <= GAP_SET_WINDOW && self.irrelevant_change_set(sn)
      {
        newly_irrelevant.push(sn);
      }
      sn += 1;
    }
    gap_list.for_each(|listed| {
      if listed - self.changes_from_writer_low_mark <= GAP_SET_WINDOW
        && self.irrelevant_change_set(listed)
      {
        newly_irrelevant.push(listed);
      }
    });

    if let Some(assembler) = &mut self.fragment_assembler {
      for sn in newly_irrelevant {
        assembler.release(sn);
      }
    }
  }

  /// Heartbeat count seen so far, for diagnostics.
  pub fn last_heartbeat_count(&self) -> i32 {
    self.last_heartbeat_count
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structure::guid::{EntityId, GuidPrefix};

  fn sn(v: i64) -> SequenceNumber {
    SequenceNumber::from(v)
  }

  fn set(base: i64, elements: &[i64]) -> SequenceNumberSet {
    let mut s = SequenceNumberSet::new(sn(base));
    for e in elements {
      s.add(sn(*e));
    }
    s
  }

  fn new_proxy() -> RtpsWriterProxy {
    let guid = GUID::new(
      GuidPrefix::new(&[1; 12]),
      EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
    );
    let mut proxy = RtpsWriterProxy::new(
      guid,
      Duration::from_millis(70),
      Duration::from_millis(5),
    );
    proxy.start(Timestamp::ZERO);
    proxy
  }

  fn heartbeat(proxy: &mut RtpsWriterProxy, count: i32, first: i64, last: i64) -> HeartbeatOutcome {
    proxy
      .process_heartbeat(count, sn(first), sn(last), false, false, Timestamp::ZERO)
      .expect("heartbeat unexpectedly stale")
  }

  #[test]
  fn missing_changes_update_tracks_heartbeats() {
    let mut proxy = new_proxy();
    assert!(proxy.initial_acknack.is_armed());

    // Writer announces one sample.
    let out = heartbeat(&mut proxy, 1, 1, 1);
    assert_eq!(out.samples_lost, 0);
    assert!(proxy.heartbeat_response.is_armed());
    assert_eq!(set(1, &[1]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(0));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(1)), 0);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(2)), 1);

    // Two more samples in the writer's history.
    let out = heartbeat(&mut proxy, 2, 1, 3);
    assert_eq!(out.samples_lost, 0);
    assert_eq!(set(1, &[1, 2, 3]), proxy.missing_changes());
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(3)), 2);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(4)), 3);

    // DATA(6): 4 and 5 become missing too.
    proxy.received_change_set(sn(6));
    assert_eq!(set(1, &[1, 2, 3, 4, 5]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(0));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(6)), 5);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(7)), 5);

    // HEARTBEAT(1,6) changes nothing.
    heartbeat(&mut proxy, 3, 1, 6);
    assert_eq!(set(1, &[1, 2, 3, 4, 5]), proxy.missing_changes());

    // HEARTBEAT(1,7) adds 7.
    heartbeat(&mut proxy, 4, 1, 7);
    assert_eq!(set(1, &[1, 2, 3, 4, 5, 7]), proxy.missing_changes());
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(8)), 6);

    // All the missing DATA arrive; prefix folds up to 6.
    for v in 1..=5 {
      proxy.received_change_set(sn(v));
    }
    assert_eq!(set(7, &[7]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(6));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(7)), 0);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(8)), 1);

    // Faulty heartbeat with lower last_sn retracts nothing.
    heartbeat(&mut proxy, 5, 1, 4);
    assert_eq!(set(7, &[7]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(6));

    // DATA(8) and DATA(10).
    proxy.received_change_set(sn(8));
    proxy.received_change_set(sn(10));
    assert_eq!(set(7, &[7, 9]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 4);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(9)), 1);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(11)), 2);
  }

  #[test]
  fn lost_changes_update_promotes_and_counts() {
    let mut proxy = new_proxy();

    // First heartbeat of an already-running writer: the gap before its
    // history is not "lost", the proxy never knew those samples.
    let out = heartbeat(&mut proxy, 1, 3, 3);
    assert_eq!(out.samples_lost, 0);
    assert_eq!(set(3, &[3]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(2));
    assert_eq!(proxy.number_of_changes_from_writer(), 1);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(4)), 1);

    // DATA(5), then HEARTBEAT(5,5): 3 and 4 are lost.
    proxy.received_change_set(sn(5));
    let out = heartbeat(&mut proxy, 2, 5, 5);
    assert_eq!(out.samples_lost, 2);
    assert_eq!(SequenceNumberSet::new(sn(6)), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(5));
    assert_eq!(proxy.number_of_changes_from_writer(), 0);

    // Faulty heartbeat with a lower first_sn does not retract LOST.
    let out = heartbeat(&mut proxy, 3, 4, 5);
    assert_eq!(out.samples_lost, 0);
    assert_eq!(proxy.available_changes_max(), sn(5));

    // DATA(7): 6 is missing.
    proxy.received_change_set(sn(7));
    assert_eq!(set(6, &[6]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 2);

    // HEARTBEAT(8,8): 6 is lost, 7 was received.
    let out = heartbeat(&mut proxy, 4, 8, 8);
    assert_eq!(out.samples_lost, 1);
    assert_eq!(set(8, &[8]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(7));

    // HEARTBEAT(10,10): 8 and the never-announced 9 are lost.
    let out = heartbeat(&mut proxy, 5, 10, 10);
    assert_eq!(out.samples_lost, 2);
    assert_eq!(set(10, &[10]), proxy.missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(9));
  }

  #[test]
  fn received_change_set_tracks_and_folds() {
    let mut proxy = new_proxy();

    proxy.received_change_set(sn(3));
    assert_eq!(set(1, &[1, 2]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 3);
    assert!(proxy.are_there_missing_changes());
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(4)), 2);

    proxy.received_change_set(sn(6));
    assert_eq!(set(1, &[1, 2, 4, 5]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 6);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(4)), 2);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(7)), 4);

    proxy.received_change_set(sn(2));
    assert_eq!(set(1, &[1, 4, 5]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 6);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(7)), 3);

    // SN 1 arrives: prefix 1..3 folds away.
    proxy.received_change_set(sn(1));
    assert_eq!(set(4, &[4, 5]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 3);
    assert_eq!(proxy.available_changes_max(), sn(3));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(7)), 2);

    // HEARTBEAT(4,6) promotes 1..3 (already folded) and changes nothing
    // else.
    heartbeat(&mut proxy, 1, 4, 6);
    assert_eq!(set(4, &[4, 5]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 3);

    proxy.received_change_set(sn(8));
    assert_eq!(set(4, &[4, 5, 7]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 5);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(9)), 3);

    proxy.received_change_set(sn(4));
    assert_eq!(set(5, &[5, 7]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 4);

    proxy.received_change_set(sn(5));
    assert_eq!(set(7, &[7]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 2);

    proxy.received_change_set(sn(7));
    assert_eq!(SequenceNumberSet::new(sn(9)), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 0);
    assert!(!proxy.are_there_missing_changes());
    assert_eq!(proxy.available_changes_max(), sn(8));
  }

  #[test]
  fn received_change_set_is_idempotent() {
    let mut proxy = new_proxy();
    assert!(proxy.received_change_set(sn(3)));
    let missing = proxy.missing_changes();
    let tracked = proxy.number_of_changes_from_writer();

    assert!(!proxy.received_change_set(sn(3)));
    assert_eq!(missing, proxy.missing_changes());
    assert_eq!(tracked, proxy.number_of_changes_from_writer());

    // below the low mark is a duplicate too
    proxy.received_change_set(sn(1));
    proxy.received_change_set(sn(2));
    assert!(!proxy.received_change_set(sn(2)));
  }

  #[test]
  fn irrelevant_change_set_mirrors_reception() {
    let mut proxy = new_proxy();

    proxy.process_gap(sn(3), &SequenceNumberSet::new(sn(4)));
    assert_eq!(set(1, &[1, 2]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 3);

    proxy.process_gap(sn(6), &SequenceNumberSet::new(sn(7)));
    assert_eq!(set(1, &[1, 2, 4, 5]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 6);

    proxy.process_gap(sn(2), &SequenceNumberSet::new(sn(3)));
    assert_eq!(set(1, &[1, 4, 5]), proxy.missing_changes());

    // gapping 1 folds 1..3
    proxy.process_gap(sn(1), &SequenceNumberSet::new(sn(2)));
    assert_eq!(set(4, &[4, 5]), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 3);
    assert_eq!(proxy.available_changes_max(), sn(3));

    proxy.process_gap(sn(8), &SequenceNumberSet::new(sn(9)));
    assert_eq!(set(4, &[4, 5, 7]), proxy.missing_changes());

    proxy.process_gap(sn(4), &SequenceNumberSet::new(sn(5)));
    proxy.process_gap(sn(5), &SequenceNumberSet::new(sn(6)));
    assert_eq!(set(7, &[7]), proxy.missing_changes());

    proxy.process_gap(sn(7), &SequenceNumberSet::new(sn(8)));
    assert_eq!(SequenceNumberSet::new(sn(9)), proxy.missing_changes());
    assert_eq!(proxy.number_of_changes_from_writer(), 0);
    assert!(!proxy.are_there_missing_changes());
  }

  #[test]
  fn process_gap_is_idempotent() {
    let mut proxy = new_proxy();
    let list = set(4, &[4, 6]);
    proxy.process_gap(sn(2), &list);
    let missing = proxy.missing_changes();
    let tracked = proxy.number_of_changes_from_writer();
    proxy.process_gap(sn(2), &list);
    assert_eq!(missing, proxy.missing_changes());
    assert_eq!(tracked, proxy.number_of_changes_from_writer());
  }

  // test_log captures the window-rejection debug logging this test drives
  #[test_log::test]
  fn gap_windows_bound_hostile_input() {
    let mut proxy = new_proxy();

    // Writer with a long history, everything missing: 1..10008.
    heartbeat(&mut proxy, 1, 1, 10008);
    assert_eq!(proxy.number_of_changes_from_writer(), 10000 + 8);
    // (spec numbering: first missing is 1, so the window shows 1..256)
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(10009)), 10008);

    // A GAP starting far past the low mark is ignored wholesale.
    proxy.process_gap(sn(1000), &SequenceNumberSet::new(sn(2001)));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(10009)), 10008);

    // Listed numbers within the window apply.
    let mut gap_set = SequenceNumberSet::new(sn(11));
    gap_set.add(sn(20));
    gap_set.add(sn(30));
    proxy.process_gap(sn(10), &gap_set);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(10009)), 10008 - 4);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(10)), 9);
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(21)), 18);

    // Listed numbers beyond low_mark + 256 are skipped individually.
    let mut far_set = SequenceNumberSet::new(sn(101));
    far_set.add(sn(200));
    proxy.process_gap(sn(100), &far_set);
    // 100 and 200 applied...
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(201)), 195);
    let mut too_far = SequenceNumberSet::new(sn(250));
    too_far.add(sn(300)); // 300 > 0 + 256
    proxy.process_gap(sn(249), &too_far);
    // 249 applied, 300 skipped: 300 numbers below 301, 6 of them received
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(301)), 294);

    // A prefix gap advances the low mark arbitrarily far, because the low
    // mark moves as it is applied.
    proxy.process_gap(sn(1), &SequenceNumberSet::new(sn(1009)));
    assert_eq!(proxy.available_changes_max(), sn(1008));
    assert_eq!(proxy.number_of_changes_from_writer(), 9000);

    // Exactly low_mark + 255 as a start is still accepted...
    let start_ok = sn(1008 + 255);
    proxy.process_gap(start_ok, &SequenceNumberSet::new(start_ok + 1));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(10009)), 9000 - 1);

    // ...one further is not.
    let start_bad = sn(1008 + 256);
    proxy.process_gap(start_bad, &SequenceNumberSet::new(start_bad + 1));
    assert_eq!(proxy.unknown_missing_changes_up_to(sn(10009)), 9000 - 1);
  }

  #[test_log::test]
  fn stale_heartbeat_count_is_swallowed() {
    let mut proxy = new_proxy();
    heartbeat(&mut proxy, 5, 1, 3);
    assert_eq!(proxy.number_of_changes_from_writer(), 3);

    // same and lower counts do nothing at all
    assert!(proxy
      .process_heartbeat(5, sn(1), sn(9), false, false, Timestamp::ZERO)
      .is_none());
    assert!(proxy
      .process_heartbeat(4, sn(1), sn(9), false, false, Timestamp::ZERO)
      .is_none());
    assert_eq!(proxy.number_of_changes_from_writer(), 3);
  }

  #[test]
  fn empty_writer_heartbeat_advances_nothing() {
    let mut proxy = new_proxy();
    proxy.received_change_set(sn(1));
    proxy.received_change_set(sn(2));

    // first_sn > last_sn + 1: accepted but inert
    let out = heartbeat(&mut proxy, 1, 11, 0);
    assert_eq!(out.samples_lost, 0);
    assert_eq!(proxy.available_changes_max(), sn(2));

    // the canonical all-gone form first = last + 1 does advance
    let out = heartbeat(&mut proxy, 2, 11, 10);
    assert_eq!(out.samples_lost, 8); // 3..10 were never received
    assert_eq!(proxy.available_changes_max(), sn(10));
  }

  #[test]
  fn final_heartbeat_without_missing_arms_no_timer() {
    let mut proxy = new_proxy();
    proxy.received_change_set(sn(1));

    let out = proxy
      .process_heartbeat(1, sn(1), sn(1), true, false, Timestamp::ZERO)
      .unwrap();
    assert!(!out.acknack_timer_armed);
    assert!(!proxy.heartbeat_response.is_armed());

    // final, but something is missing: response still due
    let out = proxy
      .process_heartbeat(2, sn(1), sn(3), true, false, Timestamp::ZERO)
      .unwrap();
    assert!(out.acknack_timer_armed);
    assert!(proxy.heartbeat_response.is_armed());
  }

  #[test]
  fn liveliness_flag_is_reported_independently_of_final() {
    let mut proxy = new_proxy();
    let out = proxy
      .process_heartbeat(1, sn(1), sn(0), true, true, Timestamp::ZERO)
      .unwrap();
    assert!(out.liveliness_asserted);
    assert!(!out.acknack_timer_armed);
  }
}
