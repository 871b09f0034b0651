use std::fmt;

use speedy::{Context, Readable, Reader, Writable, Writer};

/// RTPS submessage kind octet. Values per RTPS 2.2 Table 8.13.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubmessageKind(u8);

impl SubmessageKind {
  pub const PAD: Self = Self(0x01);
  pub const ACKNACK: Self = Self(0x06);
  pub const HEARTBEAT: Self = Self(0x07);
  pub const GAP: Self = Self(0x08);
  pub const INFO_TS: Self = Self(0x09);
  pub const INFO_SRC: Self = Self(0x0c);
  pub const INFO_REPLY_IP4: Self = Self(0x0d);
  pub const INFO_DST: Self = Self(0x0e);
  pub const INFO_REPLY: Self = Self(0x0f);
  pub const NACK_FRAG: Self = Self(0x12);
  pub const HEARTBEAT_FRAG: Self = Self(0x13);
  pub const DATA: Self = Self(0x15);
  pub const DATA_FRAG: Self = Self(0x16);
}

impl From<SubmessageKind> for u8 {
  fn from(kind: SubmessageKind) -> u8 {
    kind.0
  }
}

impl From<u8> for SubmessageKind {
  fn from(b: u8) -> Self {
    Self(b)
  }
}

impl fmt::Debug for SubmessageKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Self::PAD => write!(f, "PAD"),
      Self::ACKNACK => write!(f, "ACKNACK"),
      Self::HEARTBEAT => write!(f, "HEARTBEAT"),
      Self::GAP => write!(f, "GAP"),
      Self::INFO_TS => write!(f, "INFO_TS"),
      Self::INFO_SRC => write!(f, "INFO_SRC"),
      Self::INFO_REPLY_IP4 => write!(f, "INFO_REPLY_IP4"),
      Self::INFO_DST => write!(f, "INFO_DST"),
      Self::INFO_REPLY => write!(f, "INFO_REPLY"),
      Self::NACK_FRAG => write!(f, "NACK_FRAG"),
      Self::HEARTBEAT_FRAG => write!(f, "HEARTBEAT_FRAG"),
      Self::DATA => write!(f, "DATA"),
      Self::DATA_FRAG => write!(f, "DATA_FRAG"),
      Self(other) => write!(f, "SubmessageKind({other:#04x})"),
    }
  }
}

impl<'a, C: Context> Readable<'a, C> for SubmessageKind {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    Ok(Self(reader.read_u8()?))
  }
}

impl<C: Context> Writable<C> for SubmessageKind {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_u8(self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wire_values_match_rtps_2_2() {
    assert_eq!(u8::from(SubmessageKind::DATA), 0x15);
    assert_eq!(u8::from(SubmessageKind::DATA_FRAG), 0x16);
    assert_eq!(u8::from(SubmessageKind::HEARTBEAT), 0x07);
    assert_eq!(u8::from(SubmessageKind::GAP), 0x08);
    assert_eq!(u8::from(SubmessageKind::ACKNACK), 0x06);
    assert_eq!(u8::from(SubmessageKind::NACK_FRAG), 0x12);
  }
}
