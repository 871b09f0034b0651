//! Reader endpoint: dispatches incoming submessages to the per-writer
//! proxies, feeds reassembled samples to the reader history and produces
//! ACKNACKs.
//!
//! Entry points are called from the transport-receive thread; timer
//! callbacks arrive on the timer thread with an explicit `now`.

use std::collections::BTreeMap;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  dds::{
    qos::{QosPolicies, TopicKind},
    statusevents::{DataReaderStatus, StatusChannelSender},
  },
  history::reader_history::{NotAdmitted, ReaderHistory, SampleInfo},
  messages::submessages::{Data, DataFrag, Gap, Heartbeat},
  rtps::{
    constant::{FRAGMENT_ASSEMBLY_TIMEOUT, HEARTBEAT_RESPONSE_DELAY, INITIAL_ACKNACK_DELAY},
    fragment_assembler::FragmentAssembler,
    rtps_writer_proxy::RtpsWriterProxy,
  },
  structure::{
    cache_change::CacheChange,
    change_pool::ChangePool,
    guid::{GuidPrefix, GUID},
    time::Timestamp,
  },
};
use crate::messages::submessages::AckNack;

pub struct Reader {
  guid: GUID,
  qos: QosPolicies,
  history: ReaderHistory,
  matched_writers: BTreeMap<GUID, RtpsWriterProxy>,
  acknack_count: i32,
  status_sender: StatusChannelSender<DataReaderStatus>,
  sample_lost_total: i32,
  sample_rejected_total: i32,
}

impl Reader {
  pub fn new(
    guid: GUID,
    topic_kind: TopicKind,
    qos: QosPolicies,
    status_sender: StatusChannelSender<DataReaderStatus>,
  ) -> Self {
    let history = ReaderHistory::new(
      topic_kind,
      qos.history(),
      qos.resource_limits(),
      qos.ownership(),
    );
    Self {
      guid,
      qos,
      history,
      matched_writers: BTreeMap::new(),
      acknack_count: 0,
      status_sender,
      sample_lost_total: 0,
      sample_rejected_total: 0,
    }
  }

  pub fn guid(&self) -> GUID {
    self.guid
  }

  pub fn qos(&self) -> &QosPolicies {
    &self.qos
  }

  // ---- matching --------------------------------------------------------

  pub fn matched_writer_add(&mut self, writer_guid: GUID, ownership_strength: i32, now: Timestamp) {
    let mut proxy =
      RtpsWriterProxy::new(writer_guid, INITIAL_ACKNACK_DELAY, HEARTBEAT_RESPONSE_DELAY);
    proxy.ownership_strength = ownership_strength;
    proxy.start(now);
    info!("Matched remote writer {writer_guid:?}");
    self.matched_writers.insert(writer_guid, proxy);
  }

  /// Writer undiscovery: timers stop before the proxy goes away.
  pub fn matched_writer_remove(&mut self, writer_guid: GUID) {
    if let Some(mut proxy) = self.matched_writers.remove(&writer_guid) {
      proxy.stop();
      info!("Removed remote writer {writer_guid:?}");
    }
  }

  pub fn matched_writer(&self, writer_guid: GUID) -> Option<&RtpsWriterProxy> {
    self.matched_writers.get(&writer_guid)
  }

  // ---- submessage entry points ----------------------------------------

  /// DATA from the wire. `source_timestamp` comes from a preceding
  /// INFO_TS, when there was one.
  pub fn process_data(
    &mut self,
    pool: &mut ChangePool,
    data: &Data,
    source_prefix: GuidPrefix,
    source_timestamp: Option<Timestamp>,
    now: Timestamp,
  ) {
    let writer_guid = GUID::new(source_prefix, data.writer_id);
    let change = cache_change_of_data(data, writer_guid, source_timestamp.unwrap_or(now));
    self.accept_change(pool, writer_guid, change);
  }

  /// DATA_FRAG from the wire. When the fragment completes its sample, the
  /// whole payload takes the same path as a DATA.
  pub fn process_data_frag(
    &mut self,
    pool: &mut ChangePool,
    datafrag: &DataFrag,
    source_prefix: GuidPrefix,
    source_timestamp: Option<Timestamp>,
    now: Timestamp,
  ) {
    let writer_guid = GUID::new(source_prefix, datafrag.writer_id);
    let Some(proxy) = self.matched_writers.get_mut(&writer_guid) else {
      debug!("DATA_FRAG from unmatched writer {writer_guid:?}");
      return;
    };
    if datafrag.writer_sn <= proxy.available_changes_max() {
      return; // sample already delivered or gone
    }
    let assembler = proxy
      .fragment_assembler
      .get_or_insert_with(|| FragmentAssembler::new(datafrag.fragment_size));
    let Some(payload) = assembler.new_datafrag(datafrag, now) else {
      return;
    };

    let kind = datafrag
      .inline_qos
      .as_ref()
      .map(|qos| qos.change_kind())
      .unwrap_or(crate::structure::cache_change::ChangeKind::Alive);
    let instance_handle = datafrag
      .inline_qos
      .as_ref()
      .and_then(|qos| qos.key_hash())
      .unwrap_or_default();

    let mut change = CacheChange::new(
      kind,
      writer_guid,
      instance_handle,
      payload,
      source_timestamp.unwrap_or(now),
    );
    change.sequence_number = datafrag.writer_sn;
    change.fragment_size = datafrag.fragment_size;
    self.accept_change(pool, writer_guid, change);
  }

  pub fn process_heartbeat(
    &mut self,
    heartbeat: &Heartbeat,
    source_prefix: GuidPrefix,
    final_flag: bool,
    liveliness_flag: bool,
    now: Timestamp,
  ) {
    let writer_guid = GUID::new(source_prefix, heartbeat.writer_id);
    let Some(proxy) = self.matched_writers.get_mut(&writer_guid) else {
      debug!("HEARTBEAT from unmatched writer {writer_guid:?}");
      return;
    };
    let Some(outcome) = proxy.process_heartbeat(
      heartbeat.count,
      heartbeat.first_sn,
      heartbeat.last_sn,
      final_flag,
      liveliness_flag,
      now,
    ) else {
      return; // stale count, swallowed
    };

    if outcome.samples_lost > 0 {
      self.sample_lost_total += outcome.samples_lost as i32;
      self.status_sender.try_send(DataReaderStatus::SampleLost {
        total_count: self.sample_lost_total,
        total_count_change: outcome.samples_lost as i32,
      });
    }
    if outcome.liveliness_asserted {
      self
        .status_sender
        .try_send(DataReaderStatus::LivelinessAsserted {
          writer: writer_guid,
        });
    }
  }

  pub fn process_gap(&mut self, gap: &Gap, source_prefix: GuidPrefix) {
    let writer_guid = GUID::new(source_prefix, gap.writer_id);
    let Some(proxy) = self.matched_writers.get_mut(&writer_guid) else {
      debug!("GAP from unmatched writer {writer_guid:?}");
      return;
    };
    proxy.process_gap(gap.gap_start, &gap.gap_list);
  }

  // ---- timer events ----------------------------------------------------

  /// Initial ACKNACK after discovery: empty set based at the first
  /// undelivered sequence number, soliciting a HEARTBEAT.
  pub fn handle_initial_acknack_event(
    &mut self,
    writer_guid: GUID,
    now: Timestamp,
  ) -> Option<AckNack> {
    let proxy = self.matched_writers.get_mut(&writer_guid)?;
    if !proxy.initial_acknack.fire_if_due(now) {
      return None;
    }
    self.acknack_count += 1;
    let proxy = self.matched_writers.get(&writer_guid)?;
    Some(AckNack {
      reader_id: self.guid.entity_id,
      writer_id: writer_guid.entity_id,
      reader_sn_state: crate::structure::sequence_number::SequenceNumberSet::new(
        proxy.available_changes_max() + 1,
      ),
      count: self.acknack_count,
    })
  }

  /// Delayed HEARTBEAT response: the coalesced ACKNACK with the missing
  /// window.
  pub fn handle_heartbeat_response_event(
    &mut self,
    writer_guid: GUID,
    now: Timestamp,
  ) -> Option<AckNack> {
    let proxy = self.matched_writers.get_mut(&writer_guid)?;
    if !proxy.heartbeat_response.fire_if_due(now) {
      return None;
    }
    self.acknack_count += 1;
    let count = self.acknack_count;
    let proxy = self.matched_writers.get(&writer_guid)?;
    Some(AckNack {
      reader_id: self.guid.entity_id,
      writer_id: writer_guid.entity_id,
      reader_sn_state: proxy.missing_changes(),
      count,
    })
  }

  /// Periodic housekeeping from the timer thread.
  pub fn handle_fragment_gc_event(&mut self, now: Timestamp) {
    for proxy in self.matched_writers.values_mut() {
      if let Some(assembler) = &mut proxy.fragment_assembler {
        assembler.garbage_collect(now, FRAGMENT_ASSEMBLY_TIMEOUT);
      }
    }
  }

  // ---- application side ------------------------------------------------

  pub fn read_next(&mut self, pool: &mut ChangePool) -> Option<(SampleInfo, Bytes)> {
    self.history.read_next(pool)
  }

  pub fn take_next(&mut self, pool: &mut ChangePool) -> Option<(SampleInfo, Bytes)> {
    self.history.take_next(pool)
  }

  pub fn unread_count(&self) -> u64 {
    self.history.unread_count()
  }

  pub fn history_len(&self) -> usize {
    self.history.len()
  }

  // ---- internals -------------------------------------------------------

  fn accept_change(&mut self, pool: &mut ChangePool, writer_guid: GUID, change: CacheChange) {
    let Some(proxy) = self.matched_writers.get_mut(&writer_guid) else {
      debug!("DATA from unmatched writer {writer_guid:?}");
      return;
    };
    let sn = change.sequence_number;

    let mut lost = 0;
    if !self.qos.is_reliable() {
      // Best effort never looks back: accept only forward progress and
      // write off anything skipped over.
      if sn <= proxy.available_changes_max() {
        return;
      }
      lost = proxy.lost_changes_update(sn);
    }

    if !proxy.received_change_set(sn) {
      trace!("Duplicate DATA {sn:?} from {writer_guid:?}");
      return;
    }
    let strength = proxy.ownership_strength;
    let unknown_missing = proxy.unknown_missing_changes_up_to(sn);

    if lost > 0 {
      self.sample_lost_total += lost as i32;
      self.status_sender.try_send(DataReaderStatus::SampleLost {
        total_count: self.sample_lost_total,
        total_count_change: lost as i32,
      });
    }

    match self.history.received_change(pool, change, strength, unknown_missing) {
      Ok(_) => {}
      Err((rejected, NotAdmitted::Rejected(reason))) => {
        self.sample_rejected_total += 1;
        self.status_sender.try_send(DataReaderStatus::SampleRejected {
          total_count: self.sample_rejected_total,
          total_count_change: 1,
          reason,
          last_instance: rejected.instance_handle,
        });
      }
      Err((_, NotAdmitted::Duplicate)) | Err((_, NotAdmitted::Displaced)) => {
        // dropped silently by design
      }
    }
  }
}

fn cache_change_of_data(data: &Data, writer_guid: GUID, timestamp: Timestamp) -> CacheChange {
  let kind = data
    .inline_qos
    .as_ref()
    .map(|qos| qos.change_kind())
    .unwrap_or(crate::structure::cache_change::ChangeKind::Alive);
  let instance_handle = data
    .inline_qos
    .as_ref()
    .and_then(|qos| qos.key_hash())
    .unwrap_or_default();
  let mut change = CacheChange::new(
    kind,
    writer_guid,
    instance_handle,
    data.serialized_payload.clone(),
    timestamp,
  );
  change.sequence_number = data.writer_sn;
  change
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    dds::{qos::policy, statusevents::sync_status_channel},
    structure::{
      duration::Duration,
      guid::{EntityId, GuidPrefix},
      sequence_number::{SequenceNumber, SequenceNumberSet},
    },
  };

  fn sn(v: i64) -> SequenceNumber {
    SequenceNumber::from(v)
  }

  fn reader_guid() -> GUID {
    GUID::new(
      GuidPrefix::new(&[2; 12]),
      EntityId::new([0, 0, 1], crate::structure::guid::EntityKind::READER_WITH_KEY_USER_DEFINED),
    )
  }

  fn writer_guid() -> GUID {
    GUID::new(
      GuidPrefix::new(&[1; 12]),
      EntityId::new([0, 0, 1], crate::structure::guid::EntityKind::WRITER_WITH_KEY_USER_DEFINED),
    )
  }

  fn reliable_reader() -> (Reader, crate::dds::statusevents::StatusChannelReceiver<DataReaderStatus>) {
    let (tx, rx) = sync_status_channel(16);
    let qos = QosPolicies::builder()
      .history(policy::History::KeepAll)
      .reliable(Duration::from_millis(100))
      .build();
    let mut reader = Reader::new(reader_guid(), TopicKind::NoKey, qos, tx);
    reader.matched_writer_add(writer_guid(), 0, Timestamp::ZERO);
    (reader, rx)
  }

  fn data(sn_value: i64, payload: &'static [u8]) -> Data {
    Data {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      writer_sn: sn(sn_value),
      inline_qos: None,
      serialized_payload: Bytes::from_static(payload),
    }
  }

  fn heartbeat(count: i32, first: i64, last: i64) -> Heartbeat {
    Heartbeat {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      first_sn: sn(first),
      last_sn: sn(last),
      count,
    }
  }

  // S1: a freshly matched reader announces itself with an empty ACKNACK
  // based at 1.
  #[test]
  fn initial_acknack_on_empty_writer() {
    let (mut reader, _rx) = reliable_reader();
    let fire_at = Timestamp::ZERO + INITIAL_ACKNACK_DELAY;
    // not due yet
    assert!(reader
      .handle_initial_acknack_event(writer_guid(), Timestamp::ZERO)
      .is_none());
    let acknack = reader
      .handle_initial_acknack_event(writer_guid(), fire_at)
      .unwrap();
    assert_eq!(acknack.reader_sn_state, SequenceNumberSet::new(sn(1)));
    assert_eq!(acknack.reader_sn_state.base(), sn(1));
    assert!(acknack.reader_sn_state.is_empty());
    assert_eq!(acknack.count, 1);
  }

  // S2: heartbeat announces 1..3, all three DATA arrive out of order, the
  // missing set empties and everything is delivered in order.
  #[test]
  fn missing_then_filled() {
    let (mut reader, _rx) = reliable_reader();
    let mut pool = ChangePool::new();
    let prefix = writer_guid().prefix;
    let now = Timestamp::ZERO;

    reader.process_heartbeat(&heartbeat(1, 1, 3), prefix, false, false, now);
    {
      let proxy = reader.matched_writer(writer_guid()).unwrap();
      let mut expected = SequenceNumberSet::new(sn(1));
      expected.add(sn(1));
      expected.add(sn(2));
      expected.add(sn(3));
      assert_eq!(proxy.missing_changes(), expected);
    }

    reader.process_data(&mut pool, &data(2, b"two"), prefix, None, now);
    reader.process_data(&mut pool, &data(1, b"one"), prefix, None, now);
    reader.process_data(&mut pool, &data(3, b"three"), prefix, None, now);

    let proxy = reader.matched_writer(writer_guid()).unwrap();
    assert!(proxy.missing_changes().is_empty());
    assert_eq!(proxy.available_changes_max(), sn(3));

    let taken: Vec<i64> = std::iter::from_fn(|| reader.take_next(&mut pool))
      .map(|(info, _)| info.sequence_number.into())
      .collect();
    assert_eq!(taken, vec![1, 2, 3]);
  }

  // S3: writer has moved on; 3 and 4 are promoted to LOST and the status
  // event reports them.
  #[test]
  fn lost_promotion() {
    let (mut reader, rx) = reliable_reader();
    let mut pool = ChangePool::new();
    let prefix = writer_guid().prefix;
    let now = Timestamp::ZERO;

    reader.process_data(&mut pool, &data(1, b"a"), prefix, None, now);
    reader.process_data(&mut pool, &data(2, b"b"), prefix, None, now);
    assert_eq!(
      reader.matched_writer(writer_guid()).unwrap().available_changes_max(),
      sn(2)
    );

    reader.process_heartbeat(&heartbeat(2, 5, 5), prefix, false, false, now);
    match rx.try_recv() {
      Some(DataReaderStatus::SampleLost {
        total_count,
        total_count_change,
      }) => {
        assert_eq!(total_count, 2);
        assert_eq!(total_count_change, 2);
      }
      other => panic!("expected SampleLost, got {other:?}"),
    }

    reader.process_data(&mut pool, &data(5, b"e"), prefix, None, now);
    assert_eq!(
      reader.matched_writer(writer_guid()).unwrap().available_changes_max(),
      sn(5)
    );
  }

  #[test]
  fn heartbeat_response_produces_coalesced_acknack() {
    let (mut reader, _rx) = reliable_reader();
    let prefix = writer_guid().prefix;
    let now = Timestamp::ZERO;

    reader.process_heartbeat(&heartbeat(1, 1, 2), prefix, false, false, now);
    // timer not elapsed yet
    assert!(reader
      .handle_heartbeat_response_event(writer_guid(), now)
      .is_none());

    let later = now + HEARTBEAT_RESPONSE_DELAY;
    let acknack = reader
      .handle_heartbeat_response_event(writer_guid(), later)
      .unwrap();
    assert_eq!(acknack.reader_sn_state.base(), sn(1));
    assert_eq!(acknack.reader_sn_state.count(), 2);

    // single fire per arming
    assert!(reader
      .handle_heartbeat_response_event(writer_guid(), later)
      .is_none());
  }

  #[test]
  fn duplicate_data_is_dropped_silently() {
    let (mut reader, _rx) = reliable_reader();
    let mut pool = ChangePool::new();
    let prefix = writer_guid().prefix;
    reader.process_data(&mut pool, &data(1, b"a"), prefix, None, Timestamp::ZERO);
    reader.process_data(&mut pool, &data(1, b"a"), prefix, None, Timestamp::ZERO);
    assert_eq!(reader.history_len(), 1);
    assert_eq!(reader.unread_count(), 1);
  }

  #[test]
  fn gap_resolves_missing_numbers() {
    let (mut reader, _rx) = reliable_reader();
    let mut pool = ChangePool::new();
    let prefix = writer_guid().prefix;
    let now = Timestamp::ZERO;

    reader.process_data(&mut pool, &data(3, b"c"), prefix, None, now);
    let gap = Gap {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      gap_start: sn(1),
      gap_list: SequenceNumberSet::new(sn(3)),
    };
    reader.process_gap(&gap, prefix);
    let proxy = reader.matched_writer(writer_guid()).unwrap();
    assert!(proxy.missing_changes().is_empty());
    assert_eq!(proxy.available_changes_max(), sn(3));
  }

  #[test]
  fn fragmented_sample_is_reassembled_and_delivered() {
    let (mut reader, _rx) = reliable_reader();
    let mut pool = ChangePool::new();
    let prefix = writer_guid().prefix;
    let now = Timestamp::ZERO;

    let frag = |num: u32, bytes: &'static [u8]| DataFrag {
      reader_id: reader_guid().entity_id,
      writer_id: writer_guid().entity_id,
      writer_sn: sn(1),
      fragment_starting_num: crate::structure::sequence_number::FragmentNumber(num),
      fragments_in_submessage: 1,
      fragment_size: 4,
      data_size: 8,
      inline_qos: None,
      serialized_payload: Bytes::from_static(bytes),
    };

    reader.process_data_frag(&mut pool, &frag(2, b"efgh"), prefix, None, now);
    assert_eq!(reader.history_len(), 0);
    reader.process_data_frag(&mut pool, &frag(1, b"abcd"), prefix, None, now);

    let (info, payload) = reader.take_next(&mut pool).unwrap();
    assert_eq!(info.sequence_number, sn(1));
    assert_eq!(payload.as_ref(), b"abcdefgh");
    assert_eq!(
      reader.matched_writer(writer_guid()).unwrap().available_changes_max(),
      sn(1)
    );
  }

  #[test]
  fn best_effort_skips_backwards_data() {
    let (tx, _rx) = sync_status_channel(4);
    let qos = QosPolicies::builder()
      .history(policy::History::KeepAll)
      .best_effort()
      .build();
    let mut reader = Reader::new(reader_guid(), TopicKind::NoKey, qos, tx);
    reader.matched_writer_add(writer_guid(), 0, Timestamp::ZERO);
    let mut pool = ChangePool::new();
    let prefix = writer_guid().prefix;

    reader.process_data(&mut pool, &data(5, b"e"), prefix, None, Timestamp::ZERO);
    // old data is not resurrected
    reader.process_data(&mut pool, &data(2, b"b"), prefix, None, Timestamp::ZERO);
    assert_eq!(reader.history_len(), 1);
    assert_eq!(
      reader.matched_writer(writer_guid()).unwrap().available_changes_max(),
      sn(5)
    );
  }
}
