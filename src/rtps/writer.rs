//! Writer endpoint: sample admission with QoS enforcement, deadline and
//! lifespan timers, acknowledgement bookkeeping and submessage production.
//!
//! The writer state sits behind one mutex; `write_sample` under KEEP_ALL
//! may block on the condvar until acknowledgements free space or
//! `max_blocking_time` runs out. The change pool has its own lock and is
//! only ever taken after the writer lock, never across a wait.

use std::{
  collections::BTreeMap,
  sync::{Condvar, Mutex, MutexGuard},
  time::Instant,
};

use bytes::Bytes;
use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  dds::{
    qos::{policy, QosPolicies, TopicKind},
    result::{HistoryError, WriteError, WriteResult},
    statusevents::{DataWriterStatus, StatusChannelSender},
  },
  history::writer_history::WriterHistory,
  messages::{
    parameter_list::{Parameter, ParameterList, PID_KEY_HASH},
    submessage_flag::DATAFRAG_Flags,
    submessages::{AckNack, Data, DataFrag, Gap, Heartbeat, NackFrag},
  },
  rtps::{
    constant::DEFAULT_FRAGMENT_SIZE_THRESHOLD, rtps_reader_proxy::RtpsReaderProxy,
    timed_event::TimedEvent,
  },
  structure::{
    cache_change::{CacheChange, ChangeKind, InstanceHandle, WriteParams},
    change_pool::ChangePool,
    duration::Duration,
    guid::{EntityId, GuidPrefix, GUID},
    sequence_number::{FragmentNumber, SequenceNumber, SequenceNumberSet},
    time::Timestamp,
  },
};

struct WriterInner {
  qos: QosPolicies,
  history: WriterHistory,
  matched_readers: BTreeMap<GUID, RtpsReaderProxy>,
  heartbeat_count: i32,
  deadline_timer: TimedEvent,
  /// Instance whose deadline the timer currently waits on.
  deadline_owner: Option<InstanceHandle>,
  lifespan_timer: TimedEvent,
  offered_deadline_missed_total: i32,
  /// Evicted-but-unacknowledged samples waiting to be declared as GAPs.
  pending_gaps: Vec<SequenceNumber>,
  status_sender: StatusChannelSender<DataWriterStatus>,
  fragment_size_threshold: u32,
}

pub struct Writer {
  guid: GUID,
  topic_kind: TopicKind,
  inner: Mutex<WriterInner>,
  acked_cond: Condvar,
}

impl Writer {
  pub fn new(
    guid: GUID,
    topic_kind: TopicKind,
    qos: QosPolicies,
    status_sender: StatusChannelSender<DataWriterStatus>,
  ) -> Self {
    let history = WriterHistory::new(topic_kind, qos.history(), qos.resource_limits());
    let inner = WriterInner {
      deadline_timer: TimedEvent::new(qos.deadline_period()),
      lifespan_timer: TimedEvent::new(qos.lifespan_duration()),
      qos,
      history,
      matched_readers: BTreeMap::new(),
      heartbeat_count: 0,
      deadline_owner: None,
      offered_deadline_missed_total: 0,
      pending_gaps: Vec::new(),
      status_sender,
      fragment_size_threshold: DEFAULT_FRAGMENT_SIZE_THRESHOLD,
    };
    Self {
      guid,
      topic_kind,
      inner: Mutex::new(inner),
      acked_cond: Condvar::new(),
    }
  }

  pub fn guid(&self) -> GUID {
    self.guid
  }

  fn lock(&self) -> MutexGuard<'_, WriterInner> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  // ---- matching --------------------------------------------------------

  pub fn matched_reader_add(&self, reader_guid: GUID, is_reliable: bool) {
    let mut inner = self.lock();
    info!("Matched remote reader {reader_guid:?}");
    inner
      .matched_readers
      .insert(reader_guid, RtpsReaderProxy::new(reader_guid, is_reliable));
  }

  pub fn matched_reader_remove(&self, reader_guid: GUID) {
    let mut inner = self.lock();
    if inner.matched_readers.remove(&reader_guid).is_some() {
      info!("Removed remote reader {reader_guid:?}");
    }
    drop(inner);
    // one fewer reader may unblock a KEEP_ALL writer
    self.acked_cond.notify_all();
  }

  // ---- writing ---------------------------------------------------------

  /// Admits one sample, assigning its sequence number.
  ///
  /// Blocking: under RELIABLE + KEEP_ALL a full history waits for
  /// acknowledgements up to `max_blocking_time` (a deadline from call
  /// entry, not a per-retry interval) and then fails.
  pub fn write_sample(
    &self,
    pool: &Mutex<ChangePool>,
    kind: ChangeKind,
    instance_handle: InstanceHandle,
    data: Bytes,
    wparams: WriteParams,
    now: Timestamp,
  ) -> WriteResult<SequenceNumber> {
    let entered = Instant::now();
    let mut inner = self.lock();

    let source_timestamp = wparams.source_timestamp.unwrap_or(now);
    let mut change = CacheChange::new(kind, self.guid, instance_handle, data, source_timestamp);

    // Oversized payloads fragment only when publishing asynchronously.
    if change.data_size() > inner.fragment_size_threshold as usize {
      match inner.qos.publish_mode() {
        policy::PublishMode::Synchronous => {
          return Err(WriteError::History(HistoryError::TooLarge {
            size: change.data_size(),
            threshold: inner.fragment_size_threshold,
          }));
        }
        policy::PublishMode::Asynchronous => {
          change.fragment_size = inner.fragment_size_threshold.min(u16::MAX as u32) as u16;
        }
      }
    }

    let max_blocking = match inner.qos.reliability() {
      policy::Reliability::Reliable { max_blocking_time } => max_blocking_time,
      policy::Reliability::BestEffort => Duration::ZERO,
    };
    let keep_all = matches!(inner.qos.history(), policy::History::KeepAll);

    let outcome = loop {
      let attempt = {
        let mut pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
        inner.history.add_change(&mut pool_guard, change)
      };
      match attempt {
        Ok(outcome) => break outcome,
        Err((returned, HistoryError::CapacityFull(reason))) if keep_all => {
          change = returned;
          // first preference: drop a fully acknowledged sample
          if self.try_remove_acked_min(&mut inner, pool) {
            continue;
          }
          let elapsed = Duration::from(entered.elapsed());
          if max_blocking.is_infinite() {
            let (guard, _) = self
              .acked_cond
              .wait_timeout(inner, std::time::Duration::from_millis(100))
              .unwrap_or_else(|p| p.into_inner());
            inner = guard;
            continue;
          }
          if elapsed >= max_blocking {
            debug!("write_sample timed out waiting for history space: {reason}");
            return Err(WriteError::History(HistoryError::Timeout));
          }
          let remaining = remaining_std(max_blocking, entered);
          let (guard, _) = self
            .acked_cond
            .wait_timeout(inner, remaining)
            .unwrap_or_else(|p| p.into_inner());
          inner = guard;
          continue;
        }
        Err((_, e)) => return Err(WriteError::History(e)),
      }
    };

    // Evicted samples some reader may still wait for become GAPs.
    for sn in &outcome.evicted {
      if !self.is_acked_by_all(&inner, *sn) {
        inner.pending_gaps.push(*sn);
      }
    }

    self.register_deadline(&mut inner, instance_handle, now);
    self.arm_lifespan(&mut inner, source_timestamp);

    Ok(outcome.sequence_number)
  }

  fn try_remove_acked_min(&self, inner: &mut WriterInner, pool: &Mutex<ChangePool>) -> bool {
    let Some(min_sn) = inner.history.first_sn() else {
      return false;
    };
    if !self.is_acked_by_all(inner, min_sn) {
      return false;
    }
    let mut pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
    inner.history.remove_min_change(&mut pool_guard).is_some()
  }

  fn is_acked_by_all(&self, inner: &WriterInner, sn: SequenceNumber) -> bool {
    // With positive acks disabled, readers are not required to confirm
    // reception, so samples count as acknowledged for release purposes.
    if matches!(
      inner.qos.disable_positive_acks,
      Some(policy::DisablePositiveAcks { enabled: true, .. })
    ) {
      return true;
    }
    inner
      .matched_readers
      .values()
      .filter(|r| r.is_reliable)
      .all(|r| r.acked_up_to() >= sn)
  }

  // ---- acknowledgements ------------------------------------------------

  /// ACKNACK from the transport thread. Stale counts are swallowed here.
  pub fn process_acknack(&self, pool: &Mutex<ChangePool>, acknack: &AckNack, source_prefix: GuidPrefix) {
    let reader_guid = GUID::new(source_prefix, acknack.reader_id);
    let mut inner = self.lock();
    let Some(proxy) = inner.matched_readers.get_mut(&reader_guid) else {
      debug!("ACKNACK from unmatched reader {reader_guid:?}");
      return;
    };
    if !proxy.handle_acknack(&acknack.reader_sn_state, acknack.count) {
      return; // stale, swallowed
    }

    // VOLATILE: once every matched reader acknowledged a sample, release it.
    if inner.qos.durability() == policy::Durability::Volatile {
      loop {
        let Some(min_sn) = inner.history.first_sn() else {
          break;
        };
        if !self.is_acked_by_all(&inner, min_sn) {
          break;
        }
        let mut pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
        if inner.history.remove_min_change(&mut pool_guard).is_none() {
          break;
        }
        trace!("Released {min_sn:?} after acknowledgement by all readers");
      }
    }

    drop(inner);
    self.acked_cond.notify_all();
  }

  /// NACK_FRAG from the transport thread: resends the requested fragments
  /// of one sample. Stale counts are swallowed.
  pub fn process_nack_frag(
    &self,
    pool: &Mutex<ChangePool>,
    nack_frag: &NackFrag,
    source_prefix: GuidPrefix,
  ) -> Vec<DataFrag> {
    let reader_guid = GUID::new(source_prefix, nack_frag.reader_id);
    let mut inner = self.lock();
    let Some(proxy) = inner.matched_readers.get_mut(&reader_guid) else {
      debug!("NACK_FRAG from unmatched reader {reader_guid:?}");
      return Vec::new();
    };
    if !proxy.nackfrag_count_is_fresh(nack_frag.count) {
      return Vec::new();
    }
    drop(inner);

    self
      .data_frag_submessages_for(pool, nack_frag.writer_sn)
      .into_iter()
      .filter(|frag| nack_frag.fragment_number_state.is_set(frag.fragment_starting_num))
      .collect()
  }

  /// Samples readers asked to be resent, as DATA ready for emission.
  pub fn handle_requested_changes(&self, pool: &Mutex<ChangePool>) -> Vec<Data> {
    let mut inner = self.lock();
    let mut requested: Vec<SequenceNumber> = inner
      .matched_readers
      .values_mut()
      .flat_map(|r| r.take_requested_changes())
      .collect();
    requested.sort();
    requested.dedup();

    let pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
    let mut out = Vec::new();
    let mut gone: Vec<SequenceNumber> = Vec::new();
    for sn in requested {
      match inner
        .history
        .get_change(sn)
        .and_then(|r| pool_guard.get(r))
      {
        Some(change) => {
          out.push(self.data_of_change(change));
        }
        None => gone.push(sn), // evicted since the request: declare a GAP
      }
    }
    drop(pool_guard);
    inner.pending_gaps.extend(gone);
    out
  }

  // ---- submessage production ------------------------------------------

  pub fn heartbeat_submessage(&self) -> Heartbeat {
    let mut inner = self.lock();
    inner.heartbeat_count += 1;
    let next = inner.history.next_sequence_number();
    Heartbeat {
      reader_id: EntityId::UNKNOWN,
      writer_id: self.guid.entity_id,
      // empty history announces the canonical first = last + 1 form
      first_sn: inner.history.first_sn().unwrap_or(next),
      last_sn: inner.history.last_sn().unwrap_or(next - 1),
      count: inner.heartbeat_count,
    }
  }

  pub fn data_submessage_for(&self, pool: &Mutex<ChangePool>, sn: SequenceNumber) -> Option<Data> {
    let inner = self.lock();
    let pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
    let change = inner.history.get_change(sn).and_then(|r| pool_guard.get(r))?;
    Some(self.data_of_change(change))
  }

  /// Splits a fragmented sample into DATA_FRAG submessages, one fragment
  /// each.
  pub fn data_frag_submessages_for(
    &self,
    pool: &Mutex<ChangePool>,
    sn: SequenceNumber,
  ) -> Vec<DataFrag> {
    let inner = self.lock();
    let pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
    let Some(change) = inner.history.get_change(sn).and_then(|r| pool_guard.get(r)) else {
      return Vec::new();
    };
    if change.fragment_size == 0 {
      return Vec::new();
    }
    let frag_size = change.fragment_size as usize;
    let data_size = change.data_size() as u32;
    change
      .data
      .chunks(frag_size)
      .enumerate()
      .map(|(i, chunk)| DataFrag {
        reader_id: EntityId::UNKNOWN,
        writer_id: self.guid.entity_id,
        writer_sn: sn,
        fragment_starting_num: FragmentNumber(i as u32 + 1),
        fragments_in_submessage: 1,
        fragment_size: change.fragment_size,
        data_size,
        inline_qos: (i == 0).then(|| self.inline_qos_of(change)).flatten(),
        serialized_payload: Bytes::copy_from_slice(chunk),
      })
      .collect()
  }

  /// Drains evicted-sample GAPs accumulated since the last call.
  pub fn take_pending_gaps(&self) -> Option<Gap> {
    let mut inner = self.lock();
    if inner.pending_gaps.is_empty() {
      return None;
    }
    let mut sns = std::mem::take(&mut inner.pending_gaps);
    sns.sort();
    sns.dedup();
    let gap_start = sns[0];
    // contiguous head goes into [gap_start, base); the rest into the list
    let mut base = gap_start;
    for sn in &sns {
      if *sn == base {
        base += 1;
      } else {
        break;
      }
    }
    let mut gap_list = SequenceNumberSet::new(base);
    for sn in sns.iter().filter(|sn| **sn >= base) {
      gap_list.add(*sn);
    }
    Some(Gap {
      reader_id: EntityId::UNKNOWN,
      writer_id: self.guid.entity_id,
      gap_start,
      gap_list,
    })
  }

  fn data_of_change(&self, change: &CacheChange) -> Data {
    Data {
      reader_id: EntityId::UNKNOWN,
      writer_id: self.guid.entity_id,
      writer_sn: change.sequence_number,
      inline_qos: self.inline_qos_of(change),
      serialized_payload: change.data.clone(),
    }
  }

  fn inline_qos_of(&self, change: &CacheChange) -> Option<ParameterList> {
    if self.topic_kind == TopicKind::NoKey && change.kind == ChangeKind::Alive {
      return None;
    }
    let mut pl = ParameterList::new();
    if self.topic_kind == TopicKind::WithKey {
      pl.push(Parameter::new(PID_KEY_HASH, change.instance_handle.as_ref().to_vec()));
    }
    if change.kind != ChangeKind::Alive {
      let flags: u8 = match change.kind {
        ChangeKind::Alive => 0,
        ChangeKind::NotAliveDisposed => 0x01,
        ChangeKind::NotAliveUnregistered => 0x02,
        ChangeKind::NotAliveDisposedUnregistered => 0x03,
      };
      pl.push(Parameter::new(
        crate::messages::parameter_list::PID_STATUS_INFO,
        vec![0, 0, 0, flags],
      ));
    }
    Some(pl)
  }

  /// Flags for emitting the DATA_FRAGs of `data_frag_submessages_for`.
  pub fn datafrag_flags(&self, with_qos: bool) -> BitFlags<DATAFRAG_Flags> {
    let mut flags = BitFlags::from(DATAFRAG_Flags::Endianness);
    if with_qos {
      flags |= DATAFRAG_Flags::InlineQos;
    }
    flags
  }

  // ---- deadline timer (C3) --------------------------------------------

  fn register_deadline(&self, inner: &mut WriterInner, instance: InstanceHandle, now: Timestamp) {
    let period = inner.qos.deadline_period();
    if period.is_infinite() {
      return;
    }
    inner.history.set_next_deadline(instance, now + period);

    // The timer is rearmed only when the written instance is the current
    // owner, or no owner exists yet. Ownership otherwise changes hands
    // when the timer fires.
    if inner.deadline_owner.is_none() || inner.deadline_owner == Some(instance) {
      if let Some((owner, tp)) = inner.history.get_next_deadline() {
        inner.deadline_owner = Some(owner);
        inner.deadline_timer.restart_at(tp);
      }
    }
  }

  /// Deadline timer callback. On a miss: count it, notify, push the
  /// owner's deadline one period out and reschedule for the then-earliest
  /// instance.
  pub fn handle_deadline_event(&self, now: Timestamp) {
    let mut inner = self.lock();
    if !inner.deadline_timer.fire_if_due(now) {
      return;
    }
    let period = inner.qos.deadline_period();
    if period.is_infinite() {
      inner.deadline_owner = None;
      return;
    }

    while let Some((owner, tp)) = inner.history.get_next_deadline() {
      if tp > now {
        inner.deadline_owner = Some(owner);
        inner.deadline_timer.restart_at(tp);
        return;
      }
      inner.offered_deadline_missed_total += 1;
      let total = inner.offered_deadline_missed_total;
      inner
        .status_sender
        .try_send(DataWriterStatus::OfferedDeadlineMissed {
          total_count: total,
          total_count_change: 1,
          last_instance: owner,
        });
      inner.history.set_next_deadline(owner, tp + period);
    }
    // no instances: the timer stays cancelled
    inner.deadline_owner = None;
  }

  // ---- lifespan timer (C3) --------------------------------------------

  fn arm_lifespan(&self, inner: &mut WriterInner, source_timestamp: Timestamp) {
    let lifespan = inner.qos.lifespan_duration();
    if lifespan.is_infinite() || inner.lifespan_timer.is_armed() {
      return;
    }
    inner.lifespan_timer.restart_at(source_timestamp + lifespan);
  }

  /// Lifespan timer callback: removes expired samples (earliest first) and
  /// reschedules for the next expiry. A sample that turns out not to be
  /// expired yet only reschedules.
  pub fn handle_lifespan_event(&self, pool: &Mutex<ChangePool>, now: Timestamp) {
    let mut inner = self.lock();
    if !inner.lifespan_timer.fire_if_due(now) {
      return;
    }
    let lifespan = inner.qos.lifespan_duration();
    if lifespan.is_infinite() {
      return;
    }

    loop {
      let Some((sn, source_ts, change_ref)) = inner.history.get_earliest_change() else {
        return; // nothing cached; timer stays disarmed
      };
      let expiry = source_ts + lifespan;
      if expiry <= now {
        let mut pool_guard = pool.lock().unwrap_or_else(|p| p.into_inner());
        inner.history.remove_change_by_ref(&mut pool_guard, change_ref);
        drop(pool_guard);
        inner
          .status_sender
          .try_send(DataWriterStatus::LifespanExpired {
            sequence_number: sn,
          });
        debug!("Lifespan expired for {sn:?}");
      } else {
        inner.lifespan_timer.restart_at(expiry);
        return;
      }
    }
  }

  // ---- dynamic QoS updates --------------------------------------------

  /// Applies changed deadline/lifespan periods to the running timers.
  pub fn update_qos(&self, qos: QosPolicies) {
    let mut inner = self.lock();
    let deadline = qos.deadline_period();
    let lifespan = qos.lifespan_duration();
    inner.qos = qos;

    inner.deadline_timer.update_interval(deadline);
    if deadline.is_infinite() {
      inner.deadline_owner = None;
    }
    inner.lifespan_timer.update_interval(lifespan);
  }

  // ---- introspection for tests and callers ----------------------------

  pub fn history_len(&self) -> usize {
    self.lock().history.len()
  }

  pub fn first_sn(&self) -> Option<SequenceNumber> {
    self.lock().history.first_sn()
  }

  pub fn deadline_timer_armed(&self) -> bool {
    self.lock().deadline_timer.is_armed()
  }

  pub fn lifespan_timer_armed(&self) -> bool {
    self.lock().lifespan_timer.is_armed()
  }
}

fn remaining_std(max_blocking: Duration, entered: Instant) -> std::time::Duration {
  let max_ticks = max_blocking.to_ticks().max(0) as u128;
  let elapsed_ticks = Duration::from(entered.elapsed()).to_ticks().max(0) as u128;
  let left = max_ticks.saturating_sub(elapsed_ticks);
  // ticks are 2^-32 s
  std::time::Duration::from_nanos(((left * 1_000_000_000) >> 32) as u64)
}
