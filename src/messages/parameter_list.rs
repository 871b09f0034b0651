use speedy::{Context, Readable, Reader, Writable, Writer};

use crate::structure::{
  cache_change::{ChangeKind, InstanceHandle},
  guid::GUID,
};

pub const PID_SENTINEL: u16 = 0x0001;
pub const PID_PARTICIPANT_GUID: u16 = 0x0050;
pub const PID_KEY_HASH: u16 = 0x0070;
pub const PID_STATUS_INFO: u16 = 0x0071;

const STATUS_INFO_DISPOSED: u8 = 0x01;
const STATUS_INFO_UNREGISTERED: u8 = 0x02;

/// One inline QoS / discovery parameter: id, then a value padded to a
/// 4-byte boundary on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
  pub parameter_id: u16,
  pub value: Vec<u8>,
}

impl Parameter {
  pub fn new(parameter_id: u16, value: Vec<u8>) -> Self {
    Self {
      parameter_id,
      value,
    }
  }
}

impl<C: Context> Writable<C> for Parameter {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    let pad = (4 - self.value.len() % 4) % 4;
    writer.write_u16(self.parameter_id)?;
    writer.write_u16((self.value.len() + pad) as u16)?;
    writer.write_bytes(&self.value)?;
    for _ in 0..pad {
      writer.write_u8(0)?;
    }
    Ok(())
  }
}

/// Sequence of parameters terminated by PID_SENTINEL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterList {
  pub parameters: Vec<Parameter>,
}

impl ParameterList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, p: Parameter) {
    self.parameters.push(p);
  }

  pub fn find(&self, pid: u16) -> Option<&Parameter> {
    self.parameters.iter().find(|p| p.parameter_id == pid)
  }

  /// PID_KEY_HASH, the 16-byte instance key of the sample.
  pub fn key_hash(&self) -> Option<InstanceHandle> {
    self.find(PID_KEY_HASH).and_then(|p| {
      <[u8; 16]>::try_from(p.value.as_slice())
        .ok()
        .map(InstanceHandle::from_key_hash)
    })
  }

  /// PID_STATUS_INFO flags mapped to the change kind of a DATA submessage.
  /// Absence means an ordinary ALIVE sample.
  pub fn change_kind(&self) -> ChangeKind {
    let flags = match self.find(PID_STATUS_INFO) {
      Some(p) if p.value.len() == 4 => p.value[3],
      _ => return ChangeKind::Alive,
    };
    let disposed = flags & STATUS_INFO_DISPOSED != 0;
    let unregistered = flags & STATUS_INFO_UNREGISTERED != 0;
    match (disposed, unregistered) {
      (false, false) => ChangeKind::Alive,
      (true, false) => ChangeKind::NotAliveDisposed,
      (false, true) => ChangeKind::NotAliveUnregistered,
      (true, true) => ChangeKind::NotAliveDisposedUnregistered,
    }
  }

  /// PID_PARTICIPANT_GUID from a discovery parameter list.
  pub fn participant_guid(&self) -> Option<GUID> {
    self.find(PID_PARTICIPANT_GUID).and_then(|p| {
      <[u8; 16]>::try_from(p.value.as_slice())
        .ok()
        .map(GUID::from_bytes)
    })
  }
}

impl<'a, C: Context> Readable<'a, C> for ParameterList {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    let mut parameters = Vec::new();
    loop {
      let parameter_id = reader.read_u16()?;
      let length = reader.read_u16()? as usize;
      if parameter_id == PID_SENTINEL {
        break;
      }
      let mut value = vec![0u8; length];
      reader.read_bytes(&mut value)?;
      parameters.push(Parameter {
        parameter_id,
        value,
      });
    }
    Ok(Self { parameters })
  }
}

impl<C: Context> Writable<C> for ParameterList {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    for p in &self.parameters {
      p.write_to(writer)?;
    }
    writer.write_u16(PID_SENTINEL)?;
    writer.write_u16(0)
  }
}

#[cfg(test)]
mod tests {
  use speedy::{Endianness, Readable, Writable};

  use super::*;

  #[test]
  fn roundtrip_with_padding() {
    let mut pl = ParameterList::new();
    pl.push(Parameter::new(0x0070, vec![9; 16]));
    pl.push(Parameter::new(0x0071, vec![0, 0, 0, 1]));
    let bytes = pl.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    let parsed = ParameterList::read_from_buffer_with_ctx(Endianness::LittleEndian, &bytes).unwrap();
    assert_eq!(parsed, pl);
  }

  #[test]
  fn status_info_maps_to_change_kind() {
    let mut pl = ParameterList::new();
    assert_eq!(pl.change_kind(), ChangeKind::Alive);
    pl.push(Parameter::new(PID_STATUS_INFO, vec![0, 0, 0, 0x03]));
    assert_eq!(pl.change_kind(), ChangeKind::NotAliveDisposedUnregistered);
  }

  #[test]
  fn key_hash_extraction() {
    let mut pl = ParameterList::new();
    pl.push(Parameter::new(PID_KEY_HASH, vec![7; 16]));
    assert_eq!(
      pl.key_hash(),
      Some(InstanceHandle::from_key_hash([7; 16]))
    );
  }

  #[test]
  fn odd_length_values_are_padded_to_four() {
    let mut pl = ParameterList::new();
    pl.push(Parameter::new(0x0002, vec![1, 2, 3]));
    let bytes = pl.write_to_vec_with_ctx(Endianness::BigEndian).unwrap();
    // pid(2) + len(2) + 3 value + 1 pad + sentinel(4)
    assert_eq!(bytes.len(), 12);
    assert_eq!(bytes[3], 4); // declared length includes padding
  }
}
