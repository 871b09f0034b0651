//! Writer-side state for one matched remote reader.

use std::collections::BTreeSet;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::structure::{
  guid::GUID,
  sequence_number::{SequenceNumber, SequenceNumberSet},
};

pub struct RtpsReaderProxy {
  pub remote_reader_guid: GUID,
  pub is_reliable: bool,
  /// Highest sequence number the reader has cumulatively acknowledged.
  acked_up_to: SequenceNumber,
  /// Samples the reader has explicitly asked to be resent.
  requested_changes: BTreeSet<SequenceNumber>,
  last_acknack_count: i32,
  last_nackfrag_count: i32,
}

impl RtpsReaderProxy {
  pub fn new(remote_reader_guid: GUID, is_reliable: bool) -> Self {
    Self {
      remote_reader_guid,
      is_reliable,
      acked_up_to: SequenceNumber::ZERO,
      requested_changes: BTreeSet::new(),
      last_acknack_count: 0,
      last_nackfrag_count: 0,
    }
  }

  pub fn acked_up_to(&self) -> SequenceNumber {
    self.acked_up_to
  }

  /// Applies one ACKNACK. Returns false when the count is stale, in which
  /// case nothing changed.
  pub fn handle_acknack(&mut self, reader_sn_state: &SequenceNumberSet, count: i32) -> bool {
    if count <= self.last_acknack_count {
      debug!(
        "Stale ACKNACK count {count} (last {}) from {:?}",
        self.last_acknack_count, self.remote_reader_guid
      );
      return false;
    }
    self.last_acknack_count = count;

    // base - 1 is the cumulative acknowledgement; the ack never regresses
    self.acked_up_to = self.acked_up_to.max(reader_sn_state.base() - 1);

    self.requested_changes.clear();
    reader_sn_state.for_each(|sn| {
      self.requested_changes.insert(sn);
    });
    true
  }

  /// Stale-count guard for NACK_FRAG, counted separately from ACKNACK.
  pub fn nackfrag_count_is_fresh(&mut self, count: i32) -> bool {
    if count <= self.last_nackfrag_count {
      return false;
    }
    self.last_nackfrag_count = count;
    true
  }

  /// Drains the set of samples to resend.
  pub fn take_requested_changes(&mut self) -> Vec<SequenceNumber> {
    let requested: Vec<SequenceNumber> = self.requested_changes.iter().copied().collect();
    self.requested_changes.clear();
    requested
  }

  pub fn has_requested_changes(&self) -> bool {
    !self.requested_changes.is_empty()
  }
}
