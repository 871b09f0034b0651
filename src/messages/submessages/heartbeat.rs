use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Readable, Writable};

use crate::{
  messages::{
    submessage_flag::HEARTBEAT_Flags,
    submessage_kind::SubmessageKind,
    submessages::submessage::{
      submessage_header_of, Submessage, SubmessageBody, WriterSubmessage,
    },
  },
  structure::{guid::EntityId, sequence_number::SequenceNumber},
};

/// This message is sent from an RTPS Writer to an RTPS Reader to
/// communicate the sequence numbers of changes that the Writer has
/// available.
#[derive(Debug, PartialEq, Eq, Clone, Readable, Writable)]
pub struct Heartbeat {
  /// Identifies the Reader Entity that is being informed of the
  /// availability of a set of sequence numbers. Can be set to
  /// ENTITYID_UNKNOWN to indicate all readers for the writer that sent the
  /// message.
  pub reader_id: EntityId,

  /// Identifies the Writer Entity to which the range of sequence numbers
  /// applies.
  pub writer_id: EntityId,

  /// Identifies the first (lowest) sequence number that is available in
  /// the Writer.
  pub first_sn: SequenceNumber,

  /// Identifies the last (highest) sequence number that is available in
  /// the Writer.
  pub last_sn: SequenceNumber,

  /// A counter that is incremented each time a new Heartbeat message is
  /// sent. Readers discard Heartbeats whose count does not exceed the last
  /// one processed.
  pub count: i32,
}

impl Heartbeat {
  pub fn create_submessage(self, flags: BitFlags<HEARTBEAT_Flags>) -> Option<Submessage> {
    let content_length = match self.write_to_vec() {
      Ok(bytes) => bytes.len() as u16,
      Err(e) => {
        error!("Writer couldn't write HEARTBEAT to bytes: {e}");
        return None;
      }
    };

    Some(Submessage {
      header: submessage_header_of(SubmessageKind::HEARTBEAT, flags, content_length),
      body: SubmessageBody::Writer(WriterSubmessage::Heartbeat(self, flags)),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messages::serialization_test;

  serialization_test!( type = Heartbeat,
  {
    heartbeat,
    Heartbeat {
      reader_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_READER,
      writer_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
      first_sn: SequenceNumber::from(1),
      last_sn: SequenceNumber::from(3),
      count: 7,
    },
    le = [0x00, 0x00, 0x03, 0xc7,
          0x00, 0x00, 0x03, 0xc2,
          0x00, 0x00, 0x00, 0x00,
          0x01, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00,
          0x03, 0x00, 0x00, 0x00,
          0x07, 0x00, 0x00, 0x00],
    be = [0x00, 0x00, 0x03, 0xc7,
          0x00, 0x00, 0x03, 0xc2,
          0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x01,
          0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x03,
          0x00, 0x00, 0x00, 0x07]
  });
}
