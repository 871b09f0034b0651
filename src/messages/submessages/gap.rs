use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Readable, Writable};

use crate::{
  messages::{
    submessage_flag::GAP_Flags,
    submessage_kind::SubmessageKind,
    submessages::submessage::{
      submessage_header_of, Submessage, SubmessageBody, WriterSubmessage,
    },
  },
  structure::{
    guid::EntityId,
    sequence_number::{SequenceNumber, SequenceNumberSet},
  },
};

/// This Submessage is sent from an RTPS Writer to an RTPS Reader and
/// indicates to the RTPS Reader that a set of sequence numbers is no longer
/// relevant. The set may contain a contiguous range of sequence numbers
/// and/or a noncontiguous collection of sequence numbers.
#[derive(Debug, PartialEq, Eq, Clone, Readable, Writable)]
pub struct Gap {
  /// Identifies the Reader Entity that is being informed of the
  /// irrelevance of a set of sequence numbers.
  pub reader_id: EntityId,

  /// Identifies the Writer Entity to which the range of sequence numbers
  /// applies.
  pub writer_id: EntityId,

  /// Identifies the first sequence number in the contiguous range of
  /// irrelevant sequence numbers.
  pub gap_start: SequenceNumber,

  /// gap_list.base is the exclusive endpoint of the contiguous range, so
  /// the range covers gap_start <= sn < gap_list.base. The bits of the
  /// list name additional, noncontiguous irrelevant sequence numbers.
  pub gap_list: SequenceNumberSet,
}

impl Gap {
  pub fn create_submessage(self, flags: BitFlags<GAP_Flags>) -> Option<Submessage> {
    let content_length = match self.write_to_vec() {
      Ok(bytes) => bytes.len() as u16,
      Err(e) => {
        error!("Writer couldn't write GAP to bytes: {e}");
        return None;
      }
    };

    Some(Submessage {
      header: submessage_header_of(SubmessageKind::GAP, flags, content_length),
      body: SubmessageBody::Writer(WriterSubmessage::Gap(self, flags)),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messages::serialization_test;

  serialization_test!( type = Gap,
  {
    gap,
    Gap {
      reader_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_READER,
      writer_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
      gap_start: SequenceNumber::from(42),
      gap_list: SequenceNumberSet::new(SequenceNumber::from(7)),
    },
    le = [0x00, 0x00, 0x03, 0xc7,
          0x00, 0x00, 0x03, 0xc2,
          0x00, 0x00, 0x00, 0x00,
          0x2a, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00,
          0x07, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x00],
    be = [0x00, 0x00, 0x03, 0xc7,
          0x00, 0x00, 0x03, 0xc2,
          0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x2a,
          0x00, 0x00, 0x00, 0x00,
          0x00, 0x00, 0x00, 0x07,
          0x00, 0x00, 0x00, 0x00]
  });
}
