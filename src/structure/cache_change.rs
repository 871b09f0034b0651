use std::fmt;

use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::structure::{guid::GUID, sequence_number::SequenceNumber, time::Timestamp};

/// What a sample says about its instance.
#[derive(
  Copy,
  Clone,
  Debug,
  PartialEq,
  Eq,
  Hash,
  FromPrimitive,
  ToPrimitive,
  Serialize_repr,
  Deserialize_repr,
)]
#[repr(u8)]
pub enum ChangeKind {
  Alive = 0,
  NotAliveDisposed = 1,
  NotAliveUnregistered = 2,
  NotAliveDisposedUnregistered = 3,
}

/// 16-byte instance key, the RTPS KeyHash.
///
/// Built from the serialized key fields: short keys are zero-padded in
/// place, anything over 16 bytes is replaced by its MD5 digest.
#[derive(
  Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceHandle {
  pub(crate) bytes: [u8; 16],
}

impl InstanceHandle {
  pub const NIL: Self = Self { bytes: [0; 16] };

  pub fn from_key_hash(bytes: [u8; 16]) -> Self {
    Self { bytes }
  }

  pub fn from_serialized_key(key: &[u8]) -> Self {
    let mut bytes = [0u8; 16];
    if key.len() <= 16 {
      bytes[..key.len()].copy_from_slice(key);
    } else {
      bytes = md5::compute(key).0;
    }
    Self { bytes }
  }

  pub fn is_nil(&self) -> bool {
    *self == Self::NIL
  }
}

impl AsRef<[u8]> for InstanceHandle {
  fn as_ref(&self) -> &[u8] {
    &self.bytes
  }
}

impl fmt::Debug for InstanceHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in self.bytes.iter() {
      write!(f, "{b:02x}")?;
    }
    Ok(())
  }
}

/// Identifies one sample: who wrote it and which one it was.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleIdentity {
  pub writer_guid: GUID,
  pub sequence_number: SequenceNumber,
}

/// Per-write parameters threaded through history admission.
#[derive(Clone, Debug, Default)]
pub struct WriteParams {
  pub source_timestamp: Option<Timestamp>,
  pub related_sample_identity: Option<SampleIdentity>,
}

impl WriteParams {
  pub fn with_source_timestamp(ts: Timestamp) -> Self {
    Self {
      source_timestamp: Some(ts),
      related_sample_identity: None,
    }
  }
}

/// One sample with its metadata. Owned by exactly one history at a time,
/// through the change pool.
#[derive(Clone, Debug)]
pub struct CacheChange {
  pub kind: ChangeKind,
  pub writer_guid: GUID,
  pub sequence_number: SequenceNumber,
  pub instance_handle: InstanceHandle,
  pub source_timestamp: Timestamp,
  pub data: Bytes,
  /// 0 means the sample travels whole; nonzero is the fragment size the
  /// writer selected for DATA_FRAG emission.
  pub fragment_size: u16,
  pub is_read: bool,
}

impl CacheChange {
  pub fn new(
    kind: ChangeKind,
    writer_guid: GUID,
    instance_handle: InstanceHandle,
    data: Bytes,
    source_timestamp: Timestamp,
  ) -> Self {
    Self {
      kind,
      writer_guid,
      sequence_number: SequenceNumber::ZERO,
      instance_handle,
      source_timestamp,
      data,
      fragment_size: 0,
      is_read: false,
    }
  }

  pub fn data_size(&self) -> usize {
    self.data.len()
  }
}
