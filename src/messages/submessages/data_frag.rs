use bytes::Bytes;
use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Context, Readable, Writable, Writer};

use crate::{
  messages::{
    parameter_list::ParameterList,
    submessage_flag::{endianness_flag, DATAFRAG_Flags},
    submessage_kind::SubmessageKind,
    submessages::{
      data::read_parameter_list,
      submessage::{submessage_header_of, Submessage, SubmessageBody, WriterSubmessage},
    },
  },
  structure::{
    guid::EntityId,
    sequence_number::{FragmentNumber, SequenceNumber},
  },
};

// readerId + writerId + writerSN + fragmentStartingNum + fragmentsInSubmessage
// + fragmentSize + sampleSize
const OCTETS_TO_INLINE_QOS: u16 = 28;

/// The DataFrag Submessage extends the Data Submessage by enabling the
/// serialized data to be sent as multiple fragments, each small enough for
/// the underlying transport.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DataFrag {
  pub reader_id: EntityId,
  pub writer_id: EntityId,
  pub writer_sn: SequenceNumber,

  /// 1-based number of the first fragment carried by this submessage.
  pub fragment_starting_num: FragmentNumber,

  /// How many consecutive fragments follow `fragment_starting_num` in this
  /// submessage.
  pub fragments_in_submessage: u16,

  /// Size of one fragment in bytes. Every fragment of the sample except
  /// the last has exactly this size.
  pub fragment_size: u16,

  /// Total size of the original serialized sample.
  pub data_size: u32,

  pub inline_qos: Option<ParameterList>,

  /// The fragment bytes themselves.
  pub serialized_payload: Bytes,
}

impl DataFrag {
  /// Total number of fragments the whole sample splits into.
  pub fn total_fragments(&self) -> u32 {
    (self.data_size).div_ceil(self.fragment_size as u32).max(1)
  }

  pub fn deserialize(
    buffer: &[u8],
    flags: BitFlags<DATAFRAG_Flags>,
  ) -> Result<Self, std::io::Error> {
    let endianness = endianness_flag(flags.bits());
    let eof = || std::io::Error::from(std::io::ErrorKind::UnexpectedEof);

    if buffer.len() < 4 + OCTETS_TO_INLINE_QOS as usize {
      return Err(eof());
    }
    let octets_to_inline_qos =
      u16::read_from_buffer_with_ctx(endianness, &buffer[2..4]).map_err(|_| eof())?;

    let reader_id =
      EntityId::read_from_buffer_with_ctx(endianness, &buffer[4..8]).map_err(|_| eof())?;
    let writer_id =
      EntityId::read_from_buffer_with_ctx(endianness, &buffer[8..12]).map_err(|_| eof())?;
    let writer_sn =
      SequenceNumber::read_from_buffer_with_ctx(endianness, &buffer[12..20]).map_err(|_| eof())?;
    let fragment_starting_num =
      FragmentNumber::read_from_buffer_with_ctx(endianness, &buffer[20..24]).map_err(|_| eof())?;
    let fragments_in_submessage =
      u16::read_from_buffer_with_ctx(endianness, &buffer[24..26]).map_err(|_| eof())?;
    let fragment_size =
      u16::read_from_buffer_with_ctx(endianness, &buffer[26..28]).map_err(|_| eof())?;
    let data_size =
      u32::read_from_buffer_with_ctx(endianness, &buffer[28..32]).map_err(|_| eof())?;

    let mut pos = 4 + octets_to_inline_qos as usize;
    let inline_qos = if flags.contains(DATAFRAG_Flags::InlineQos) {
      let (qos, qos_len) = read_parameter_list(&buffer[pos..], endianness)?;
      pos += qos_len;
      Some(qos)
    } else {
      None
    };

    if pos > buffer.len() {
      return Err(eof());
    }
    let serialized_payload = Bytes::copy_from_slice(&buffer[pos..]);

    Ok(Self {
      reader_id,
      writer_id,
      writer_sn,
      fragment_starting_num,
      fragments_in_submessage,
      fragment_size,
      data_size,
      inline_qos,
      serialized_payload,
    })
  }

  pub fn create_submessage(self, flags: BitFlags<DATAFRAG_Flags>) -> Option<Submessage> {
    let content_length = match self.write_to_vec() {
      Ok(bytes) => bytes.len() as u16,
      Err(e) => {
        error!("Writer couldn't write DATA_FRAG to bytes: {e}");
        return None;
      }
    };

    Some(Submessage {
      header: submessage_header_of(SubmessageKind::DATA_FRAG, flags, content_length),
      body: SubmessageBody::Writer(WriterSubmessage::DataFrag(self, flags)),
    })
  }
}

impl<C: Context> Writable<C> for DataFrag {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_u16(0)?; // extraFlags
    writer.write_u16(OCTETS_TO_INLINE_QOS)?;
    self.reader_id.write_to(writer)?;
    self.writer_id.write_to(writer)?;
    self.writer_sn.write_to(writer)?;
    self.fragment_starting_num.write_to(writer)?;
    writer.write_u16(self.fragments_in_submessage)?;
    writer.write_u16(self.fragment_size)?;
    writer.write_u32(self.data_size)?;
    if let Some(qos) = &self.inline_qos {
      qos.write_to(writer)?;
    }
    writer.write_bytes(&self.serialized_payload)
  }
}

#[cfg(test)]
mod tests {
  use speedy::Endianness;

  use super::*;

  fn frag() -> DataFrag {
    DataFrag {
      reader_id: EntityId::UNKNOWN,
      writer_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
      writer_sn: SequenceNumber::from(9),
      fragment_starting_num: FragmentNumber(2),
      fragments_in_submessage: 1,
      fragment_size: 1024,
      data_size: 2500,
      inline_qos: None,
      serialized_payload: Bytes::from(vec![0xab; 1024]),
    }
  }

  #[test]
  fn roundtrip() {
    let f = frag();
    let flags = BitFlags::from(DATAFRAG_Flags::Endianness);
    let bytes = f.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    let parsed = DataFrag::deserialize(&bytes, flags).unwrap();
    assert_eq!(parsed, f);
  }

  #[test]
  fn total_fragments_rounds_up() {
    let f = frag();
    assert_eq!(f.total_fragments(), 3); // 2500 / 1024
  }
}
