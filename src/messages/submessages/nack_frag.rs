use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Readable, Writable};

use crate::{
  messages::{
    submessage_flag::NACKFRAG_Flags,
    submessage_kind::SubmessageKind,
    submessages::submessage::{
      submessage_header_of, ReaderSubmessage, Submessage, SubmessageBody,
    },
  },
  structure::{
    guid::EntityId,
    sequence_number::{FragmentNumberSet, SequenceNumber},
  },
};

/// The NackFrag Submessage is used to communicate the state of a Reader to
/// a Writer: which fragments of one particular sample the Reader is still
/// missing.
#[derive(Debug, PartialEq, Eq, Clone, Readable, Writable)]
pub struct NackFrag {
  pub reader_id: EntityId,
  pub writer_id: EntityId,

  /// The sample whose fragments are being negatively acknowledged.
  pub writer_sn: SequenceNumber,

  /// The set bits name the missing fragments.
  pub fragment_number_state: FragmentNumberSet,

  /// Monotonic per (reader, writer, sample); stale counts are discarded.
  pub count: i32,
}

impl NackFrag {
  pub fn create_submessage(self, flags: BitFlags<NACKFRAG_Flags>) -> Option<Submessage> {
    let content_length = match self.write_to_vec() {
      Ok(bytes) => bytes.len() as u16,
      Err(e) => {
        error!("Reader couldn't write NACK_FRAG to bytes: {e}");
        return None;
      }
    };

    Some(Submessage {
      header: submessage_header_of(SubmessageKind::NACK_FRAG, flags, content_length),
      body: SubmessageBody::Reader(ReaderSubmessage::NackFrag(self, flags)),
    })
  }
}
