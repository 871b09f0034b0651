//! Reader-side sample cache: ordered delivery, read/take cursors and
//! keyed-instance bookkeeping.

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  dds::{
    qos::{policy, TopicKind},
    result::SampleRejectedReason,
  },
  structure::{
    cache_change::{CacheChange, ChangeKind, InstanceHandle},
    change_pool::{ChangePool, ChangeRef},
    guid::GUID,
    sequence_number::SequenceNumber,
    time::Timestamp,
  },
};

/// Metadata handed to the application with every sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleInfo {
  pub writer_guid: GUID,
  pub sequence_number: SequenceNumber,
  pub instance_handle: InstanceHandle,
  pub kind: ChangeKind,
  pub source_timestamp: Timestamp,
}

/// Why an incoming sample did not make it into the history.
#[derive(Debug, PartialEq, Eq)]
pub enum NotAdmitted {
  /// Same (writer, sequence number) already cached; dropped silently.
  Duplicate,
  /// KEEP_LAST found nothing to substitute, or exclusive ownership filtered
  /// the writer out; dropped silently.
  Displaced,
  /// A resource limit refused the sample; reported through a status event.
  Rejected(SampleRejectedReason),
}

#[derive(Clone, Copy, Debug)]
struct ReaderEntry {
  sn: SequenceNumber,
  writer_guid: GUID,
  source_timestamp: Timestamp,
  instance: InstanceHandle,
  change: ChangeRef,
}

pub struct ReaderHistory {
  topic_kind: TopicKind,
  history_qos: policy::History,
  resource_limits: policy::ResourceLimits,
  ownership_qos: policy::Ownership,
  max_samples: i32,
  /// Delivery order: within one writer by sequence number; across writers
  /// by sequence number, then source timestamp.
  changes: Vec<ReaderEntry>,
  keyed_changes: Vec<(InstanceHandle, Vec<ChangeRef>)>,
  /// Exclusive-ownership arbitration state per instance.
  instance_owners: Vec<(InstanceHandle, GUID, i32)>,
  unread_count: u64,
  is_history_full: bool,
}

impl ReaderHistory {
  pub fn new(
    topic_kind: TopicKind,
    history_qos: policy::History,
    resource_limits: policy::ResourceLimits,
    ownership_qos: policy::Ownership,
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
      ownership_qos,
      max_samples,
      changes: Vec::new(),
      keyed_changes: Vec::new(),
      instance_owners: Vec::new(),
      unread_count: 0,
      is_history_full: false,
    }
  }

  pub fn len(&self) -> usize {
    self.changes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }

  pub fn unread_count(&self) -> u64 {
    self.unread_count
  }

  /// Admits a sample received from the wire.
  ///
  /// `writer_strength` is the sending writer's ownership strength;
  /// `unknown_missing_changes_up_to` is how many earlier samples of the
  /// same writer are still in flight, which KEEP_ALL reserves space for.
  pub fn received_change(
    &mut self,
    pool: &mut ChangePool,
    change: CacheChange,
    writer_strength: i32,
    unknown_missing_changes_up_to: usize,
  ) -> Result<ChangeRef, (CacheChange, NotAdmitted)> {
    // Duplicate DATA for an already-cached sample is dropped silently.
    if self
      .changes
      .iter()
      .any(|e| e.writer_guid == change.writer_guid && e.sn == change.sequence_number)
    {
      return Err((change, NotAdmitted::Duplicate));
    }

    if let policy::Ownership::Exclusive { .. } = self.ownership_qos {
      if !self.exclusive_ownership_admits(&change, writer_strength) {
        debug!(
          "Dropping sample from non-owning writer {:?}",
          change.writer_guid
        );
        return Err((change, NotAdmitted::Displaced));
      }
    }

    match self.topic_kind {
      TopicKind::NoKey => self.received_change_no_key(pool, change, unknown_missing_changes_up_to),
      TopicKind::WithKey => self.received_change_with_key(pool, change),
    }
  }

  fn received_change_no_key(
    &mut self,
    pool: &mut ChangePool,
    change: CacheChange,
    unknown_missing_changes_up_to: usize,
  ) -> Result<ChangeRef, (CacheChange, NotAdmitted)> {
    match self.history_qos {
      policy::History::KeepAll => {
        if self.changes.len() + unknown_missing_changes_up_to >= self.max_samples as usize {
          warn!("Attempting to add Data to full reader history");
          return Err((change, NotAdmitted::Rejected(SampleRejectedReason::SamplesLimit)));
        }
      }
      policy::History::KeepLast { depth } => {
        if self.changes.len() >= depth as usize {
          // substitute the oldest lower-SN sample of the same writer
          let older = self
            .changes
            .iter()
            .find(|e| e.writer_guid == change.writer_guid && e.sn < change.sequence_number)
            .map(|e| e.change);
          match older {
            Some(older) => {
              self.remove_change(pool, older);
            }
            None => return Err((change, NotAdmitted::Displaced)),
          }
        }
      }
    }
    Ok(self.insert(pool, change))
  }

  fn received_change_with_key(
    &mut self,
    pool: &mut ChangePool,
    change: CacheChange,
  ) -> Result<ChangeRef, (CacheChange, NotAdmitted)> {
    if self.find_or_create_instance(change.instance_handle).is_none() {
      warn!("History has reached the maximum number of instances");
      return Err((
        change,
        NotAdmitted::Rejected(SampleRejectedReason::InstancesLimit),
      ));
    }

    let instance_len = self.instance_len(change.instance_handle);
    match self.history_qos {
      policy::History::KeepAll => {
        if instance_len >= self.resource_limits.max_samples_per_instance as usize {
          warn!("Change not added due to maximum number of samples per instance");
          return Err((
            change,
            NotAdmitted::Rejected(SampleRejectedReason::SamplesPerInstanceLimit),
          ));
        }
      }
      policy::History::KeepLast { depth } => {
        if instance_len >= depth as usize {
          // Substitute the oldest sample of this instance with a lower SN
          // from the same writer.
          let older = self
            .changes
            .iter()
            .find(|e| {
              e.writer_guid == change.writer_guid
                && e.instance == change.instance_handle
                && e.sn < change.sequence_number
            })
            .map(|e| e.change);
          match older {
            Some(older) => {
              self.remove_change(pool, older);
            }
            None => return Err((change, NotAdmitted::Displaced)),
          }
        }
      }
    }

    if self.is_history_full {
      warn!("Attempting to add Data to full reader history");
      return Err((change, NotAdmitted::Rejected(SampleRejectedReason::SamplesLimit)));
    }

    Ok(self.insert(pool, change))
  }

  fn insert(&mut self, pool: &mut ChangePool, change: CacheChange) -> ChangeRef {
    let entry = ReaderEntry {
      sn: change.sequence_number,
      writer_guid: change.writer_guid,
      source_timestamp: change.source_timestamp,
      instance: change.instance_handle,
      change: pool.insert(change),
    };
    let at = self
      .changes
      .partition_point(|e| (e.sn, e.source_timestamp, e.writer_guid) <= (entry.sn, entry.source_timestamp, entry.writer_guid));
    self.changes.insert(at, entry);
    if self.topic_kind == TopicKind::WithKey {
      if let Some(list) = self.instance_mut(entry.instance) {
        list.push(entry.change);
      }
    }
    self.unread_count += 1;
    self.is_history_full = self.changes.len() >= self.max_samples as usize;
    entry.change
  }

  /// Returns the lowest-SN unread sample, marks it read and leaves it
  /// cached.
  pub fn read_next(&mut self, pool: &mut ChangePool) -> Option<(SampleInfo, Bytes)> {
    let entry = *self
      .changes
      .iter()
      .find(|e| matches!(pool.get(e.change), Some(c) if !c.is_read))?;
    let change = pool.get_mut(entry.change)?;
    change.is_read = true;
    self.unread_count = self.unread_count.saturating_sub(1);
    Some((info_of(change), change.data.clone()))
  }

  /// Returns the lowest-SN sample, read or not, and removes it.
  pub fn take_next(&mut self, pool: &mut ChangePool) -> Option<(SampleInfo, Bytes)> {
    let entry = *self.changes.first()?;
    let change = self.remove_change(pool, entry.change)?;
    Some((info_of(&change), change.data))
  }

  /// Removes one cached sample and returns it. Unread accounting follows
  /// the sample out.
  pub fn remove_change(&mut self, pool: &mut ChangePool, change: ChangeRef) -> Option<CacheChange> {
    let idx = self.changes.iter().position(|e| e.change == change)?;
    let entry = self.changes.remove(idx);
    if self.topic_kind == TopicKind::WithKey {
      if let Some(list) = self.instance_mut(entry.instance) {
        list.retain(|r| *r != change);
      }
    }
    let removed = pool.release(change);
    match &removed {
      Some(c) if !c.is_read => {
        self.unread_count = self.unread_count.saturating_sub(1);
      }
      Some(_) => {}
      None => error!("Reader history held a stale change ref, something is wrong"),
    }
    self.is_history_full = false;
    removed
  }

  // ---- exclusive ownership --------------------------------------------

  /// Arbitration per instance: the strongest writer owns it; on equal
  /// strength the lowest GUID wins.
  fn exclusive_ownership_admits(&mut self, change: &CacheChange, strength: i32) -> bool {
    let handle = change.instance_handle;
    match self
      .instance_owners
      .iter_mut()
      .find(|(h, _, _)| *h == handle)
    {
      None => {
        self
          .instance_owners
          .push((handle, change.writer_guid, strength));
        true
      }
      Some((_, owner, owner_strength)) => {
        if *owner == change.writer_guid {
          *owner_strength = strength;
          true
        } else if strength > *owner_strength
          || (strength == *owner_strength && change.writer_guid < *owner)
        {
          *owner = change.writer_guid;
          *owner_strength = strength;
          true
        } else {
          false
        }
      }
    }
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
}

fn info_of(change: &CacheChange) -> SampleInfo {
  SampleInfo {
    writer_guid: change.writer_guid,
    sequence_number: change.sequence_number,
    instance_handle: change.instance_handle,
    kind: change.kind,
    source_timestamp: change.source_timestamp,
  }
}
