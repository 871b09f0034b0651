use bytes::Bytes;
use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use speedy::{Context, Endianness, Readable, Writable, Writer};

use crate::{
  messages::{
    parameter_list::ParameterList,
    submessage_flag::{endianness_flag, DATA_Flags},
    submessage_kind::SubmessageKind,
    submessages::submessage::{
      submessage_header_of, Submessage, SubmessageBody, WriterSubmessage,
    },
  },
  structure::{guid::EntityId, sequence_number::SequenceNumber},
};

// readerId + writerId + writerSN
const OCTETS_TO_INLINE_QOS: u16 = 16;

/// This Submessage notifies the RTPS Reader of a change to a data-object
/// belonging to the RTPS Writer.
///
/// Serialization is flag-dependent, so reading goes through
/// [`Data::deserialize`] with the flag octet of the submessage header
/// rather than through a speedy `Readable` impl.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Data {
  pub reader_id: EntityId,
  pub writer_id: EntityId,
  pub writer_sn: SequenceNumber,
  /// Present iff the InlineQos flag is set.
  pub inline_qos: Option<ParameterList>,
  /// Serialized sample (Data flag) or serialized key (Key flag), opaque to
  /// the protocol layer. Empty when neither flag is set.
  pub serialized_payload: Bytes,
}

impl Data {
  pub fn deserialize(buffer: &[u8], flags: BitFlags<DATA_Flags>) -> Result<Self, std::io::Error> {
    let endianness = endianness_flag(flags.bits());
    let eof = || std::io::Error::from(std::io::ErrorKind::UnexpectedEof);

    if buffer.len() < 4 + OCTETS_TO_INLINE_QOS as usize {
      return Err(eof());
    }
    // extraFlags (2 octets) ignored, then octetsToInlineQos
    let octets_to_inline_qos =
      u16::read_from_buffer_with_ctx(endianness, &buffer[2..4]).map_err(|_| eof())?;

    let reader_id =
      EntityId::read_from_buffer_with_ctx(endianness, &buffer[4..8]).map_err(|_| eof())?;
    let writer_id =
      EntityId::read_from_buffer_with_ctx(endianness, &buffer[8..12]).map_err(|_| eof())?;
    let writer_sn =
      SequenceNumber::read_from_buffer_with_ctx(endianness, &buffer[12..20]).map_err(|_| eof())?;

    let mut pos = 4 + octets_to_inline_qos as usize;
    let inline_qos = if flags.contains(DATA_Flags::InlineQos) {
      let (qos, qos_len) = read_parameter_list(&buffer[pos..], endianness)?;
      pos += qos_len;
      Some(qos)
    } else {
      None
    };

    let serialized_payload =
      if flags.contains(DATA_Flags::Data) || flags.contains(DATA_Flags::Key) {
        if pos > buffer.len() {
          return Err(eof());
        }
        Bytes::copy_from_slice(&buffer[pos..])
      } else {
        Bytes::new()
      };

    Ok(Self {
      reader_id,
      writer_id,
      writer_sn,
      inline_qos,
      serialized_payload,
    })
  }

  pub fn create_submessage(self, flags: BitFlags<DATA_Flags>) -> Option<Submessage> {
    let content_length = match self.write_to_vec() {
      Ok(bytes) => bytes.len() as u16,
      Err(e) => {
        error!("Writer couldn't write DATA to bytes: {e}");
        return None;
      }
    };

    Some(Submessage {
      header: submessage_header_of(SubmessageKind::DATA, flags, content_length),
      body: SubmessageBody::Writer(WriterSubmessage::Data(self, flags)),
    })
  }
}

impl<C: Context> Writable<C> for Data {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_u16(0)?; // extraFlags
    writer.write_u16(OCTETS_TO_INLINE_QOS)?;
    self.reader_id.write_to(writer)?;
    self.writer_id.write_to(writer)?;
    self.writer_sn.write_to(writer)?;
    if let Some(qos) = &self.inline_qos {
      qos.write_to(writer)?;
    }
    writer.write_bytes(&self.serialized_payload)
  }
}

/// Reads a sentinel-terminated parameter list and reports how many bytes it
/// occupied, which speedy's buffer reading does not expose.
pub(crate) fn read_parameter_list(
  buffer: &[u8],
  endianness: Endianness,
) -> Result<(ParameterList, usize), std::io::Error> {
  let eof = || std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
  let mut end = 0usize;
  loop {
    if end + 4 > buffer.len() {
      return Err(eof());
    }
    let pid = u16::read_from_buffer_with_ctx(endianness, &buffer[end..end + 2]).map_err(|_| eof())?;
    let len =
      u16::read_from_buffer_with_ctx(endianness, &buffer[end + 2..end + 4]).map_err(|_| eof())?;
    end += 4;
    if pid == crate::messages::parameter_list::PID_SENTINEL {
      break;
    }
    end += len as usize;
    if end > buffer.len() {
      return Err(eof());
    }
  }
  let list = ParameterList::read_from_buffer_with_ctx(endianness, &buffer[..end])
    .map_err(|e| std::io::Error::other(e))?;
  Ok((list, end))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messages::parameter_list::{Parameter, PID_STATUS_INFO};

  fn sample_data(with_qos: bool) -> Data {
    Data {
      reader_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_READER,
      writer_id: EntityId::SEDP_BUILTIN_PUBLICATIONS_WRITER,
      writer_sn: SequenceNumber::from(3),
      inline_qos: with_qos.then(|| {
        let mut pl = ParameterList::new();
        pl.push(Parameter::new(PID_STATUS_INFO, vec![0, 0, 0, 1]));
        pl
      }),
      serialized_payload: Bytes::from_static(&[0x00, 0x01, 0x00, 0x00, 0xca, 0xfe]),
    }
  }

  #[test]
  fn roundtrip_without_inline_qos() {
    let data = sample_data(false);
    let flags = BitFlags::from(DATA_Flags::Endianness) | DATA_Flags::Data;
    let bytes = data.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    let parsed = Data::deserialize(&bytes, flags).unwrap();
    assert_eq!(parsed, data);
  }

  #[test]
  fn roundtrip_with_inline_qos() {
    let data = sample_data(true);
    let flags = BitFlags::from(DATA_Flags::Endianness) | DATA_Flags::Data | DATA_Flags::InlineQos;
    let bytes = data.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    let parsed = Data::deserialize(&bytes, flags).unwrap();
    assert_eq!(parsed, data);
    assert!(parsed.inline_qos.is_some());
  }

  #[test]
  fn big_endian_roundtrip() {
    let data = sample_data(true);
    let flags = BitFlags::from(DATA_Flags::Data) | DATA_Flags::InlineQos;
    let bytes = data.write_to_vec_with_ctx(Endianness::BigEndian).unwrap();
    let parsed = Data::deserialize(&bytes, flags).unwrap();
    assert_eq!(parsed, data);
  }

  #[test]
  fn truncated_input_is_an_error() {
    let data = sample_data(false);
    let flags = BitFlags::from(DATA_Flags::Endianness) | DATA_Flags::Data;
    let bytes = data.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    assert!(Data::deserialize(&bytes[..10], flags).is_err());
  }
}
