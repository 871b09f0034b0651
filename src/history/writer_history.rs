//! Writer-side sample cache with QoS-aware admission and eviction.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  dds::{
    qos::{policy, TopicKind},
    result::HistoryError,
  },
  structure::{
    cache_change::{CacheChange, InstanceHandle},
    change_pool::{ChangePool, ChangeRef},
    sequence_number::SequenceNumber,
    time::Timestamp,
  },
};

/// One admitted sample, with the fields protocol queries need copied out so
/// they can be answered without touching the pool.
#[derive(Clone, Copy, Debug)]
struct HistoryEntry {
  sn: SequenceNumber,
  instance: InstanceHandle,
  source_timestamp: Timestamp,
  change: ChangeRef,
}

/// Outcome of a successful admission.
#[derive(Debug)]
pub struct AddOutcome {
  pub sequence_number: SequenceNumber,
  pub change: ChangeRef,
  /// Samples that were evicted to make room. The writer turns the unsent
  /// ones into GAPs.
  pub evicted: Vec<SequenceNumber>,
}

pub struct WriterHistory {
  topic_kind: TopicKind,
  history_qos: policy::History,
  resource_limits: policy::ResourceLimits,
  /// Effective cap on the flat sample count, derived from history kind and
  /// resource limits at construction.
  max_samples: i32,
  changes: Vec<HistoryEntry>, // ascending sequence number
  keyed_changes: Vec<(InstanceHandle, Vec<ChangeRef>)>,
  next_deadlines: Vec<(InstanceHandle, Timestamp)>,
  is_history_full: bool,
  next_sequence_number: SequenceNumber,
}

impl WriterHistory {
  pub fn new(
    topic_kind: TopicKind,
    history_qos: policy::History,
    resource_limits: policy::ResourceLimits,
  ) -> Self {
    let max_samples = match history_qos {
      policy::History::KeepAll => resource_limits.max_samples,
      policy::History::KeepLast { depth } => match topic_kind {
        TopicKind::NoKey => depth,
        TopicKind::WithKey => depth.saturating_mul(resource_limits.max_instances),
      },
    };
    Self {
      topic_kind,
      history_qos,
      resource_limits,
      max_samples,
      changes: Vec::new(),
      keyed_changes: Vec::new(),
      next_deadlines: Vec::new(),
      is_history_full: false,
      next_sequence_number: SequenceNumber::new(1),
    }
  }

  pub fn len(&self) -> usize {
    self.changes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }

  pub fn is_history_full(&self) -> bool {
    self.is_history_full
  }

  /// Lowest sequence number still cached, for HEARTBEAT first_sn.
  pub fn first_sn(&self) -> Option<SequenceNumber> {
    self.changes.first().map(|e| e.sn)
  }

  /// Highest sequence number still cached, for HEARTBEAT last_sn.
  pub fn last_sn(&self) -> Option<SequenceNumber> {
    self.changes.last().map(|e| e.sn)
  }

  /// The sequence number the next admitted sample will take.
  pub fn next_sequence_number(&self) -> SequenceNumber {
    self.next_sequence_number
  }

  pub fn get_change(&self, sn: SequenceNumber) -> Option<ChangeRef> {
    self
      .changes
      .binary_search_by_key(&sn, |e| e.sn)
      .ok()
      .map(|i| self.changes[i].change)
  }

  /// Admits a sample and assigns it the next sequence number.
  ///
  /// Under KEEP_LAST a full history (or a full instance) evicts the oldest
  /// competing sample. Under KEEP_ALL a full history is reported as
  /// `CapacityFull`; blocking up to max_blocking_time is the writer's job,
  /// which retries admission as acknowledgements release space.
  pub fn add_change(
    &mut self,
    pool: &mut ChangePool,
    mut change: CacheChange,
  ) -> Result<AddOutcome, (CacheChange, HistoryError)> {
    let mut evicted = Vec::new();

    if self.is_history_full {
      let made_room = match self.history_qos {
        policy::History::KeepAll => false,
        policy::History::KeepLast { .. } => {
          let victim = match self.topic_kind {
            TopicKind::NoKey => self.changes.first().map(|e| e.change),
            // evict the oldest sample of the same instance; fall back to
            // the overall oldest if this key has nothing cached yet
            TopicKind::WithKey => self
              .oldest_of_instance(change.instance_handle)
              .or_else(|| self.changes.first().map(|e| e.change)),
          };
          match victim {
            Some(v) => {
              if let Some(sn) = self.remove_change_by_ref(pool, v) {
                evicted.push(sn);
                true
              } else {
                false
              }
            }
            None => false,
          }
        }
      };
      if !made_room {
        warn!("Attempting to add Data to full writer history");
        return Err((change, HistoryError::CapacityFull("writer history full")));
      }
    }

    if self.topic_kind == TopicKind::WithKey {
      if self.find_or_create_instance(change.instance_handle).is_none() {
        warn!("History has reached the maximum number of instances");
        return Err((change, HistoryError::CapacityFull("max_instances reached")));
      }

      let instance_len = self.instance_len(change.instance_handle);
      match self.history_qos {
        policy::History::KeepAll => {
          if instance_len >= self.resource_limits.max_samples_per_instance as usize {
            warn!("Change not added due to maximum number of samples per instance");
            return Err((
              change,
              HistoryError::CapacityFull("max_samples_per_instance reached"),
            ));
          }
        }
        policy::History::KeepLast { depth } => {
          if instance_len >= depth as usize {
            match self.oldest_of_instance(change.instance_handle) {
              Some(victim) => {
                if let Some(sn) = self.remove_change_by_ref(pool, victim) {
                  evicted.push(sn);
                } else {
                  return Err((
                    change,
                    HistoryError::CapacityFull("could not evict from instance"),
                  ));
                }
              }
              None => {
                return Err((
                  change,
                  HistoryError::CapacityFull("could not evict from instance"),
                ));
              }
            }
          }
        }
      }
    }

    let sn = self.next_sequence_number;
    self.next_sequence_number += 1;
    change.sequence_number = sn;

    let entry = HistoryEntry {
      sn,
      instance: change.instance_handle,
      source_timestamp: change.source_timestamp,
      change: pool.insert(change),
    };
    if self.topic_kind == TopicKind::WithKey {
      if let Some(list) = self.instance_mut(entry.instance) {
        list.push(entry.change);
      }
    }
    self.changes.push(entry);
    self.is_history_full = self.changes.len() >= self.max_samples as usize;

    debug!("Change {sn:?} added to writer history");
    Ok(AddOutcome {
      sequence_number: sn,
      change: entry.change,
      evicted,
    })
  }

  /// Removes the oldest sample. Returns its sequence number.
  pub fn remove_min_change(&mut self, pool: &mut ChangePool) -> Option<SequenceNumber> {
    let victim = self.changes.first().map(|e| e.change)?;
    self.remove_change_by_ref(pool, victim)
  }

  pub fn remove_all_changes(&mut self, pool: &mut ChangePool) -> usize {
    let mut removed = 0;
    while let Some(victim) = self.changes.first().map(|e| e.change) {
      if self.remove_change_by_ref(pool, victim).is_none() {
        break;
      }
      removed += 1;
    }
    removed
  }

  /// Removes one sample by handle and returns its sequence number.
  pub fn remove_change_by_ref(
    &mut self,
    pool: &mut ChangePool,
    change: ChangeRef,
  ) -> Option<SequenceNumber> {
    let idx = self.changes.iter().position(|e| e.change == change)?;
    let entry = self.changes.remove(idx);
    if self.topic_kind == TopicKind::WithKey {
      if let Some(list) = self.instance_mut(entry.instance) {
        list.retain(|r| *r != change);
      }
    }
    if pool.release(change).is_none() {
      error!("Writer history held a stale change ref, something is wrong");
    }
    self.is_history_full = false;
    Some(entry.sn)
  }

  /// The sample the lifespan timer watches: lowest SN, ties broken by the
  /// earliest source timestamp.
  pub fn get_earliest_change(&self) -> Option<(SequenceNumber, Timestamp, ChangeRef)> {
    self
      .changes
      .iter()
      .min_by_key(|e| (e.sn, e.source_timestamp))
      .map(|e| (e.sn, e.source_timestamp, e.change))
  }

  // ---- instance bookkeeping -------------------------------------------

  fn instance_mut(&mut self, handle: InstanceHandle) -> Option<&mut Vec<ChangeRef>> {
    self
      .keyed_changes
      .iter_mut()
      .find(|(h, _)| *h == handle)
      .map(|(_, list)| list)
  }

  fn instance_len(&self, handle: InstanceHandle) -> usize {
    self
      .keyed_changes
      .iter()
      .find(|(h, _)| *h == handle)
      .map(|(_, list)| list.len())
      .unwrap_or(0)
  }

  fn oldest_of_instance(&self, handle: InstanceHandle) -> Option<ChangeRef> {
    let list = self
      .keyed_changes
      .iter()
      .find(|(h, _)| *h == handle)
      .map(|(_, list)| list)?;
    self
      .changes
      .iter()
      .filter(|e| list.contains(&e.change))
      .min_by_key(|e| (e.sn, e.source_timestamp))
      .map(|e| e.change)
  }

  /// Finds the slot for `handle`, creating one if limits allow. At the
  /// instance limit, a slot that has gone empty is reused for the new key.
  fn find_or_create_instance(&mut self, handle: InstanceHandle) -> Option<usize> {
    if let Some(i) = self.keyed_changes.iter().position(|(h, _)| *h == handle) {
      return Some(i);
    }
    if (self.keyed_changes.len() as i32) < self.resource_limits.max_instances {
      self.keyed_changes.push((handle, Vec::new()));
      return Some(self.keyed_changes.len() - 1);
    }
    if let Some(i) = self.keyed_changes.iter().position(|(_, list)| list.is_empty()) {
      self.keyed_changes.remove(i);
      self.keyed_changes.push((handle, Vec::new()));
      return Some(self.keyed_changes.len() - 1);
    }
    None
  }

  // ---- deadline bookkeeping -------------------------------------------

  /// Records when `handle` next misses its deadline.
  pub fn set_next_deadline(&mut self, handle: InstanceHandle, tp: Timestamp) {
    match self.next_deadlines.iter_mut().find(|(h, _)| *h == handle) {
      Some((_, t)) => *t = tp,
      None => self.next_deadlines.push((handle, tp)),
    }
  }

  /// The instance whose deadline expires first.
  pub fn get_next_deadline(&self) -> Option<(InstanceHandle, Timestamp)> {
    self.next_deadlines.iter().min_by_key(|(_, t)| *t).copied()
  }

  pub fn next_deadline_of(&self, handle: InstanceHandle) -> Option<Timestamp> {
    self
      .next_deadlines
      .iter()
      .find(|(h, _)| *h == handle)
      .map(|(_, t)| *t)
  }
}
