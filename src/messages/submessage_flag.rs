//! Per-submessage-kind flag octets.
//!
//! Bit 0 of every submessage is the endianness flag: set means the
//! submessage elements are little-endian.

use enumflags2::{bitflags, BitFlags};
use speedy::Endianness;

#[allow(non_camel_case_types)]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DATA_Flags {
  Endianness = 0b0000_0001,
  InlineQos = 0b0000_0010,
  Data = 0b0000_0100,
  Key = 0b0000_1000,
  NonStandardPayload = 0b0001_0000,
}

#[allow(non_camel_case_types)]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DATAFRAG_Flags {
  Endianness = 0b0000_0001,
  InlineQos = 0b0000_0010,
  Key = 0b0000_0100,
  NonStandardPayload = 0b0000_1000,
}

#[allow(non_camel_case_types)]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HEARTBEAT_Flags {
  Endianness = 0b0000_0001,
  Final = 0b0000_0010,
  Liveliness = 0b0000_0100,
}

#[allow(non_camel_case_types)]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ACKNACK_Flags {
  Endianness = 0b0000_0001,
  Final = 0b0000_0010,
}

#[allow(non_camel_case_types)]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GAP_Flags {
  Endianness = 0b0000_0001,
}

#[allow(non_camel_case_types)]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NACKFRAG_Flags {
  Endianness = 0b0000_0001,
}

/// Decodes the endianness bit shared by all submessage kinds.
pub fn endianness_flag(flags: u8) -> Endianness {
  if flags & 0x01 != 0 {
    Endianness::LittleEndian
  } else {
    Endianness::BigEndian
  }
}

pub fn flags_for_endianness<F>(endianness: Endianness) -> BitFlags<F>
where
  F: enumflags2::BitFlag<Numeric = u8>,
{
  match endianness {
    Endianness::LittleEndian => BitFlags::<F>::from_bits_truncate(0x01),
    Endianness::BigEndian => BitFlags::<F>::empty(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endianness_bit_is_bit_zero() {
    assert_eq!(endianness_flag(0x01), Endianness::LittleEndian);
    assert_eq!(endianness_flag(0x02), Endianness::BigEndian);
    let le: BitFlags<GAP_Flags> = flags_for_endianness(Endianness::LittleEndian);
    assert_eq!(le.bits(), 0x01);
  }
}
