use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Endianness, Readable, Writable};

use crate::messages::{
  submessage_flag::*,
  submessage_kind::SubmessageKind,
  submessages::{AckNack, Data, DataFrag, Gap, Heartbeat, NackFrag},
};

/// Leading 4 bytes of every submessage: kind, flag octet and the length of
/// the body that follows.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Readable, Writable)]
pub struct SubmessageHeader {
  pub kind: SubmessageKind,
  pub flags: u8,
  pub content_length: u16,
}

/// Submessages originated by a writer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum WriterSubmessage {
  Data(Data, BitFlags<DATA_Flags>),
  DataFrag(DataFrag, BitFlags<DATAFRAG_Flags>),
  Gap(Gap, BitFlags<GAP_Flags>),
  Heartbeat(Heartbeat, BitFlags<HEARTBEAT_Flags>),
}

/// Submessages originated by a reader.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ReaderSubmessage {
  AckNack(AckNack, BitFlags<ACKNACK_Flags>),
  NackFrag(NackFrag, BitFlags<NACKFRAG_Flags>),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SubmessageBody {
  Writer(WriterSubmessage),
  Reader(ReaderSubmessage),
}

/// A parsed or about-to-be-sent submessage.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Submessage {
  pub header: SubmessageHeader,
  pub body: SubmessageBody,
}

impl Submessage {
  /// Endianness of the body, from the flag octet.
  pub fn endianness(&self) -> Endianness {
    endianness_flag(self.header.flags)
  }

  /// Serializes header and body. The header's length field is trusted to
  /// have been computed by `create_submessage` of the body type.
  pub fn write_to_vec(&self) -> Result<Vec<u8>, std::io::Error> {
    let e = self.endianness();
    let mut out = Vec::with_capacity(4 + self.header.content_length as usize);
    self
      .header
      .write_to_stream_with_ctx(e, &mut out)
      .map_err(speedy_to_io)?;
    let mut body = match &self.body {
      SubmessageBody::Writer(WriterSubmessage::Data(m, _)) => m.write_to_vec_with_ctx(e),
      SubmessageBody::Writer(WriterSubmessage::DataFrag(m, _)) => m.write_to_vec_with_ctx(e),
      SubmessageBody::Writer(WriterSubmessage::Gap(m, _)) => m.write_to_vec_with_ctx(e),
      SubmessageBody::Writer(WriterSubmessage::Heartbeat(m, _)) => m.write_to_vec_with_ctx(e),
      SubmessageBody::Reader(ReaderSubmessage::AckNack(m, _)) => m.write_to_vec_with_ctx(e),
      SubmessageBody::Reader(ReaderSubmessage::NackFrag(m, _)) => m.write_to_vec_with_ctx(e),
    }
    .map_err(speedy_to_io)?;
    out.append(&mut body);
    Ok(out)
  }
}

fn speedy_to_io(e: speedy::Error) -> std::io::Error {
  std::io::Error::other(e)
}

pub(crate) fn submessage_header_of<F>(
  kind: SubmessageKind,
  flags: BitFlags<F>,
  content_length: u16,
) -> SubmessageHeader
where
  F: enumflags2::BitFlag<Numeric = u8>,
{
  SubmessageHeader {
    kind,
    flags: flags.bits(),
    content_length,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    messages::submessages::Gap,
    structure::{
      guid::EntityId,
      sequence_number::{SequenceNumber, SequenceNumberSet},
    },
  };

  #[test]
  fn submessage_serializes_header_then_body() {
    let gap = Gap {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
      gap_start: SequenceNumber::from(1),
      gap_list: SequenceNumberSet::new(SequenceNumber::from(3)),
    };
    let submessage = gap
      .create_submessage(flags_for_endianness(Endianness::LittleEndian))
      .unwrap();
    assert_eq!(submessage.endianness(), Endianness::LittleEndian);

    let bytes = submessage.write_to_vec().unwrap();
    assert_eq!(bytes.len(), 4 + submessage.header.content_length as usize);
    assert_eq!(bytes[0], u8::from(SubmessageKind::GAP));
    assert_eq!(bytes[1], 0x01); // endianness flag
  }
}
