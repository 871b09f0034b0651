//! Property bags and token structures shared by the security plugins.

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Named text attribute of a token or a configuration policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
  pub name: String,
  pub value: String,
  /// Whether the property travels to remote participants or stays local.
  pub propagate: bool,
}

impl Property {
  pub fn with_propagate(name: &str, value: String) -> Self {
    Self {
      name: name.to_string(),
      value,
      propagate: true,
    }
  }
}

/// Named binary attribute. The handshake tokens are built of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryProperty {
  pub name: String,
  pub value: Bytes,
  pub propagate: bool,
}

impl BinaryProperty {
  pub fn with_propagate(name: &str, value: Bytes) -> Self {
    Self {
      name: name.to_string(),
      value,
      propagate: true,
    }
  }
}

/// Big-endian CDR image of a BinaryPropertySeq, the byte string that
/// handshake hashes and signatures are computed over. Both ends build the
/// same sequence from the same named fields, so the images agree.
///
/// Layout per CDR: u32 element count; per property a string (u32 length
/// including NUL, bytes, NUL, pad to 4) followed by a byte sequence
/// (u32 length, bytes, pad to 4).
pub fn serialize_binary_properties(properties: &[BinaryProperty]) -> Vec<u8> {
  let mut out: Vec<u8> = Vec::new();
  out
    .write_u32::<BigEndian>(properties.len() as u32)
    .expect("vec write");
  for p in properties {
    let name = p.name.as_bytes();
    out
      .write_u32::<BigEndian>(name.len() as u32 + 1)
      .expect("vec write");
    out.extend_from_slice(name);
    out.push(0);
    while out.len() % 4 != 0 {
      out.push(0);
    }
    out
      .write_u32::<BigEndian>(p.value.len() as u32)
      .expect("vec write");
    out.extend_from_slice(&p.value);
    while out.len() % 4 != 0 {
      out.push(0);
    }
  }
  out
}

/// Generic token: a class id plus property bags, the DDS-SEC DataHolder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataHolder {
  pub class_id: String,
  pub properties: Vec<Property>,
  pub binary_properties: Vec<BinaryProperty>,
}

impl DataHolder {
  pub fn with_class_id(class_id: &str) -> Self {
    Self {
      class_id: class_id.to_string(),
      properties: Vec::new(),
      binary_properties: Vec::new(),
    }
  }

  pub fn get_property(&self, name: &str) -> Option<&str> {
    self
      .properties
      .iter()
      .find(|p| p.name == name)
      .map(|p| p.value.as_str())
  }

  pub fn get_binary_property(&self, name: &str) -> Option<Bytes> {
    self
      .binary_properties
      .iter()
      .find(|p| p.name == name)
      .map(|p| p.value.clone())
  }
}

/// Token advertising a participant's identity in discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityToken {
  pub data_holder: DataHolder,
}

impl IdentityToken {
  pub fn class_id(&self) -> &str {
    &self.data_holder.class_id
  }
}

/// One message of the three-step authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessageToken {
  pub data_holder: DataHolder,
}

impl HandshakeMessageToken {
  pub fn class_id(&self) -> &str {
    &self.data_holder.class_id
  }
}

impl From<DataHolder> for HandshakeMessageToken {
  fn from(data_holder: DataHolder) -> Self {
    Self { data_holder }
  }
}

/// Credentials of an authenticated peer, handed to access control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPeerCredentialToken {
  /// Peer's identity certificate, PEM.
  pub c_id: Bytes,
  /// Peer's signed permissions document, as transmitted.
  pub c_perm: Bytes,
}
