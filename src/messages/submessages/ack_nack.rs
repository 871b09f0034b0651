use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Readable, Writable};

use crate::{
  messages::{
    submessage_flag::ACKNACK_Flags,
    submessage_kind::SubmessageKind,
    submessages::submessage::{
      submessage_header_of, ReaderSubmessage, Submessage, SubmessageBody,
    },
  },
  structure::{guid::EntityId, sequence_number::SequenceNumberSet},
};

/// This Submessage is sent from an RTPS Reader to an RTPS Writer. It
/// combines a cumulative acknowledgement (everything below the bitmap base
/// has been received or declared irrelevant) with a selective negative
/// acknowledgement (the set bits are still missing).
#[derive(Debug, PartialEq, Eq, Clone, Readable, Writable)]
pub struct AckNack {
  /// Identifies the Reader entity that acknowledges receipt of certain
  /// sequence numbers and/or requests to receive certain sequence numbers.
  pub reader_id: EntityId,

  /// Identifies the Writer entity that is the target of the AckNack
  /// message. This is the Writer Entity that is being asked to re-send
  /// some sequence numbers or is being informed of the reception of
  /// certain sequence numbers.
  pub writer_id: EntityId,

  /// Communicates the state of the reader to the writer. All sequence
  /// numbers up to the one prior to readerSNState.base are confirmed as
  /// received by the reader. The sequence numbers that appear in the set
  /// indicate missing sequence numbers on the reader side.
  pub reader_sn_state: SequenceNumberSet,

  /// A counter that is incremented each time a new AckNack message is
  /// sent. Provides the means for a Writer to detect duplicate AckNack
  /// messages that can result from the presence of redundant communication
  /// paths.
  pub count: i32,
}

impl AckNack {
  pub fn create_submessage(self, flags: BitFlags<ACKNACK_Flags>) -> Option<Submessage> {
    let content_length = match self.write_to_vec() {
      Ok(bytes) => bytes.len() as u16,
      Err(e) => {
        error!("Reader couldn't write ACKNACK to bytes: {e}");
        return None;
      }
    };

    Some(Submessage {
      header: submessage_header_of(SubmessageKind::ACKNACK, flags, content_length),
      body: SubmessageBody::Reader(ReaderSubmessage::AckNack(self, flags)),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{messages::serialization_test, structure::sequence_number::SequenceNumber};

  serialization_test!( type = AckNack,
  {
    acknack_empty_set,
    AckNack {
      reader_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_READER,
      writer_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
      reader_sn_state: SequenceNumberSet::new(SequenceNumber::from(1)),
      count: 1,
    },
    le = [0x00, 0x00, 0x03, 0xc7,
          0x00, 0x00, 0x03, 0xc2,
          0x00, 0x00, 0x00, 0x00,
          0x01, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00,
          0x01, 0x00, 0x00, 0x00],
    be = [0x00, 0x00, 0x03, 0xc7,
          0x00, 0x00, 0x03, 0xc2,
          0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x01,
          0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x01]
  });
}
