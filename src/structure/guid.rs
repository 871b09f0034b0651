use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use speedy::{Context, Readable, Reader, Writable, Writer};

/// The first 12 bytes of a GUID. All endpoints of one participant share the
/// prefix, so it identifies the participant on the wire.
#[derive(
  Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize,
)]
pub struct GuidPrefix {
  pub(crate) bytes: [u8; 12],
}

impl GuidPrefix {
  pub const UNKNOWN: Self = Self { bytes: [0; 12] };

  pub fn new(prefix: &[u8]) -> Self {
    let mut bytes: [u8; 12] = [0; 12];
    for (i, b) in prefix.iter().enumerate() {
      if i >= 12 {
        break;
      }
      bytes[i] = *b;
    }
    Self { bytes }
  }

  /// Fresh random prefix for a new participant.
  pub fn random_for_new_participant() -> Self {
    let mut bytes = [0u8; 12];
    rand::rng().fill(&mut bytes);
    Self { bytes }
  }

  pub fn as_bytes(&self) -> &[u8; 12] {
    &self.bytes
  }
}

impl AsRef<[u8]> for GuidPrefix {
  fn as_ref(&self) -> &[u8] {
    &self.bytes
  }
}

impl fmt::Debug for GuidPrefix {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in self.bytes.iter() {
      write!(f, "{b:02x}")?;
    }
    Ok(())
  }
}

impl<'a, C: Context> Readable<'a, C> for GuidPrefix {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    let mut bytes = [0; 12];
    reader.read_bytes(&mut bytes)?;
    Ok(Self { bytes })
  }
}

impl<C: Context> Writable<C> for GuidPrefix {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_bytes(&self.bytes)
  }
}

/// Last byte of an EntityId. Identifies what sort of entity the id names.
#[derive(
  Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize,
)]
pub struct EntityKind(u8);

impl EntityKind {
  // User-defined entities
  pub const WRITER_WITH_KEY_USER_DEFINED: Self = Self(0x02);
  pub const WRITER_NO_KEY_USER_DEFINED: Self = Self(0x03);
  pub const READER_NO_KEY_USER_DEFINED: Self = Self(0x04);
  pub const READER_WITH_KEY_USER_DEFINED: Self = Self(0x07);
  // Built-in entities
  pub const PARTICIPANT_BUILT_IN: Self = Self(0xc1);
  pub const WRITER_WITH_KEY_BUILT_IN: Self = Self(0xc2);
  pub const WRITER_NO_KEY_BUILT_IN: Self = Self(0xc3);
  pub const READER_NO_KEY_BUILT_IN: Self = Self(0xc4);
  pub const READER_WITH_KEY_BUILT_IN: Self = Self(0xc7);

  pub const UNKNOWN: Self = Self(0x00);

  pub fn is_reader(&self) -> bool {
    let e = self.0 & 0x0f;
    e == 0x04 || e == 0x07
  }

  pub fn is_writer(&self) -> bool {
    let e = self.0 & 0x0f;
    e == 0x02 || e == 0x03
  }
}

impl From<u8> for EntityKind {
  fn from(b: u8) -> Self {
    Self(b)
  }
}

impl From<EntityKind> for u8 {
  fn from(ek: EntityKind) -> Self {
    ek.0
  }
}

impl fmt::Debug for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Self::WRITER_WITH_KEY_USER_DEFINED => write!(f, "Writer(key)"),
      Self::WRITER_NO_KEY_USER_DEFINED => write!(f, "Writer(no key)"),
      Self::READER_NO_KEY_USER_DEFINED => write!(f, "Reader(no key)"),
      Self::READER_WITH_KEY_USER_DEFINED => write!(f, "Reader(key)"),
      Self::PARTICIPANT_BUILT_IN => write!(f, "Participant"),
      Self::WRITER_WITH_KEY_BUILT_IN => write!(f, "Writer(key;built-in)"),
      Self::WRITER_NO_KEY_BUILT_IN => write!(f, "Writer(no key;built-in)"),
      Self::READER_NO_KEY_BUILT_IN => write!(f, "Reader(no key;built-in)"),
      Self::READER_WITH_KEY_BUILT_IN => write!(f, "Reader(key;built-in)"),
      Self::UNKNOWN => write!(f, "unknown entity kind"),
      Self(other) => write!(f, "EntityKind({other:x?})"),
    }
  }
}

/// RTPS EntityId: 3-byte key plus the kind octet.
#[derive(
  Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash, Serialize, Deserialize,
)]
pub struct EntityId {
  pub entity_key: [u8; 3],
  pub entity_kind: EntityKind,
}

impl EntityId {
  pub const UNKNOWN: Self = Self {
    entity_key: [0x00; 3],
    entity_kind: EntityKind::UNKNOWN,
  };
  pub const PARTICIPANT: Self = Self {
    entity_key: [0x00, 0x00, 0x01],
    entity_kind: EntityKind::PARTICIPANT_BUILT_IN,
  };
  pub const SEDP_BUILTIN_PUBLICATIONS_WRITER: Self = Self {
    entity_key: [0x00, 0x00, 0x03],
    entity_kind: EntityKind::WRITER_WITH_KEY_BUILT_IN,
  };
  pub const SEDP_BUILTIN_PUBLICATIONS_READER: Self = Self {
    entity_key: [0x00, 0x00, 0x03],
    entity_kind: EntityKind::READER_WITH_KEY_BUILT_IN,
  };
  pub const SEDP_BUILTIN_SUBSCRIPTIONS_WRITER: Self = Self {
    entity_key: [0x00, 0x00, 0x04],
    entity_kind: EntityKind::WRITER_WITH_KEY_BUILT_IN,
  };
  pub const SEDP_BUILTIN_SUBSCRIPTIONS_READER: Self = Self {
    entity_key: [0x00, 0x00, 0x04],
    entity_kind: EntityKind::READER_WITH_KEY_BUILT_IN,
  };

  pub fn new(entity_key: [u8; 3], entity_kind: EntityKind) -> Self {
    Self {
      entity_key,
      entity_kind,
    }
  }
}

impl fmt::Debug for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:02x}{:02x}{:02x} {:?}",
      self.entity_key[0], self.entity_key[1], self.entity_key[2], self.entity_kind
    )
  }
}

impl<'a, C: Context> Readable<'a, C> for EntityId {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    let mut entity_key = [0; 3];
    reader.read_bytes(&mut entity_key)?;
    let entity_kind = EntityKind(reader.read_u8()?);
    Ok(Self {
      entity_key,
      entity_kind,
    })
  }
}

impl<C: Context> Writable<C> for EntityId {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_bytes(&self.entity_key)?;
    writer.write_u8(self.entity_kind.0)
  }
}

/// Globally unique endpoint identity: participant prefix + entity id.
///
/// The derived lexicographic order is significant: the authentication
/// handshake assigns the requester role to the participant with the smaller
/// GUID.
#[derive(
  Copy,
  Clone,
  Default,
  PartialOrd,
  PartialEq,
  Ord,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Readable,
  Writable,
)]
pub struct GUID {
  pub prefix: GuidPrefix,
  pub entity_id: EntityId,
}

impl GUID {
  pub const UNKNOWN: Self = Self {
    prefix: GuidPrefix::UNKNOWN,
    entity_id: EntityId::UNKNOWN,
  };

  pub fn new(prefix: GuidPrefix, entity_id: EntityId) -> Self {
    Self { prefix, entity_id }
  }

  pub fn new_participant_guid() -> Self {
    Self {
      prefix: GuidPrefix::random_for_new_participant(),
      entity_id: EntityId::PARTICIPANT,
    }
  }

  /// Same participant, different entity.
  pub fn from_prefix(self, entity_id: EntityId) -> Self {
    Self {
      prefix: self.prefix,
      entity_id,
    }
  }

  pub fn to_bytes(self) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..12].copy_from_slice(&self.prefix.bytes);
    bytes[12..15].copy_from_slice(&self.entity_id.entity_key);
    bytes[15] = self.entity_id.entity_kind.0;
    bytes
  }

  pub fn from_bytes(bytes: [u8; 16]) -> Self {
    let mut prefix = [0u8; 12];
    prefix.copy_from_slice(&bytes[..12]);
    Self {
      prefix: GuidPrefix { bytes: prefix },
      entity_id: EntityId::new(
        [bytes[12], bytes[13], bytes[14]],
        EntityKind::from(bytes[15]),
      ),
    }
  }

  #[cfg(test)]
  pub fn dummy_test_guid(entity_kind: EntityKind) -> Self {
    Self {
      prefix: GuidPrefix::new(b"FakeTestGUID"),
      entity_id: EntityId {
        entity_key: [1, 2, 3],
        entity_kind,
      },
    }
  }
}

impl fmt::Debug for GUID {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "GUID {{{:?} {:?}}}", self.prefix, self.entity_id)
  }
}
