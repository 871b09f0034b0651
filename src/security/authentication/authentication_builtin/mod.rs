//! The builtin DDS:Auth:PKI-DH authentication plugin.

use std::collections::HashMap;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use ring::rand::{SecureRandom, SystemRandom};
use speedy::{Endianness, Readable};

use crate::{
  create_security_error_and_log,
  messages::parameter_list::ParameterList,
  security::{
    authentication::{Challenge, HandshakeHandle, IdentityHandle, SharedSecret},
    certificate::{Certificate, CertificateRevocationList, Sha256},
    private_key::PrivateKey,
    types::Property,
    SecurityResult,
  },
  structure::guid::{GuidPrefix, GUID},
};

mod authentication;
pub(crate) mod dh;
pub(crate) mod types;

use dh::{DHKeys, KeyAgreementKind};
use types::{BuiltinIdentityToken, KeyAgreementPreference};

/// Configuration of the authentication plugin for one participant. The
/// string fields are document URIs (`file:`, `data:`, or `pkcs11:` for the
/// private key).
#[derive(Debug, Clone)]
pub struct AuthenticationConfig {
  pub identity_ca: String,
  pub identity_certificate: String,
  pub identity_crl: Option<String>,
  pub private_key: String,
  pub password: Option<String>,
  pub preferred_key_agreement: KeyAgreementPreference,
  /// Serialize algorithm names in the legacy internal form instead of the
  /// DDS-SEC 1.1 names. Both forms are always accepted on input.
  pub transmit_algorithms_as_legacy: bool,
}

impl AuthenticationConfig {
  /// Reads the `dds.sec.auth.builtin.PKI-DH.*` properties of a
  /// participant's property policy.
  pub fn from_properties(properties: &[Property]) -> SecurityResult<Self> {
    let find = |name: &str| {
      properties
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.value.clone())
    };
    let require = |name: &str| {
      find(name).ok_or_else(|| create_security_error_and_log!("Not found {name} property"))
    };

    Ok(Self {
      identity_ca: require(types::IDENTITY_CA_PROPERTY_NAME)?,
      identity_certificate: require(types::IDENTITY_CERTIFICATE_PROPERTY_NAME)?,
      identity_crl: find(types::IDENTITY_CRL_PROPERTY_NAME),
      private_key: require(types::PRIVATE_KEY_PROPERTY_NAME)?,
      password: find(types::PASSWORD_PROPERTY_NAME),
      preferred_key_agreement: match find(types::PREFERRED_KEY_AGREEMENT_PROPERTY_NAME) {
        Some(value) => KeyAgreementPreference::parse(&value)?,
        None => KeyAgreementPreference::Auto,
      },
      transmit_algorithms_as_legacy: find(types::TRANSMIT_LEGACY_ALGORITHMS_PROPERTY_NAME)
        .map(|v| v == "true")
        .unwrap_or(false),
    })
  }
}

/// Progress of one remote participant's handshake. The key material lives
/// inside the state, so states move, they are not cloned.
#[derive(Debug)]
pub(crate) enum BuiltinHandshakeState {
  /// We have the lower GUID: we must send the request.
  PendingRequestSend,
  /// We have the higher GUID: we wait for the remote's request.
  PendingRequestMessage,
  /// Request sent; waiting for the reply.
  PendingReplyMessage {
    dh1: DHKeys,
    challenge1: Challenge,
    hash_c1: Sha256,
  },
  /// Reply sent; waiting for the final message.
  PendingFinalMessage {
    hash_c1: Sha256,
    hash_c2: Sha256,
    dh1_public: Bytes,
    dh2: DHKeys,
    challenge1: Challenge,
    challenge2: Challenge,
    remote_id_certificate: Certificate,
  },
  /// Terminal: we were the requester and sent the final message.
  CompletedWithFinalMessageSent {
    challenge1: Challenge,
    challenge2: Challenge,
    shared_secret: SharedSecret,
  },
  /// Terminal: we were the replier and received the final message.
  CompletedWithFinalMessageReceived {
    challenge1: Challenge,
    challenge2: Challenge,
    shared_secret: SharedSecret,
  },
}

pub(crate) struct LocalParticipantInfo {
  identity_handle: IdentityHandle,
  identity_token: BuiltinIdentityToken,
  guid: GUID,
  identity_certificate: Certificate,
  id_cert_private_key: PrivateKey,
  identity_ca: Certificate,
  crl: Option<CertificateRevocationList>,
  /// Signed permissions document, carried opaquely as c.perm. Filled in by
  /// initialization after access control has produced it.
  signed_permissions_document: Bytes,
  kagree_kind: KeyAgreementKind,
  transmit_algorithms_as_legacy: bool,
}

pub(crate) struct RemoteParticipantInfo {
  identity_certificate: Option<Certificate>,
  signed_permissions_document: Option<Bytes>,
  handshake_state: BuiltinHandshakeState,
}

/// Plugin instance, one per participant. Calls on one handshake handle
/// must be serialized by the caller.
pub struct AuthenticationBuiltin {
  local_participant_info: Option<LocalParticipantInfo>,
  remote_participant_infos: HashMap<IdentityHandle, RemoteParticipantInfo>,
  // handshake handle and identity handle are related 1:1
  handshake_to_identity_handle_map: HashMap<HandshakeHandle, IdentityHandle>,
  next_identity_handle: u32,
  next_handshake_handle: u32,
  secure_random_generator: SystemRandom,
}

impl AuthenticationBuiltin {
  pub fn new() -> Self {
    Self {
      local_participant_info: None,
      remote_participant_infos: HashMap::new(),
      handshake_to_identity_handle_map: HashMap::new(),
      next_identity_handle: 0,
      next_handshake_handle: 0,
      secure_random_generator: SystemRandom::new(),
    }
  }

  fn get_new_identity_handle(&mut self) -> IdentityHandle {
    let handle = IdentityHandle(self.next_identity_handle);
    self.next_identity_handle += 1;
    handle
  }

  fn get_new_handshake_handle(&mut self) -> HandshakeHandle {
    let handle = HandshakeHandle(self.next_handshake_handle);
    self.next_handshake_handle += 1;
    handle
  }

  fn get_local_participant_info(&self) -> SecurityResult<&LocalParticipantInfo> {
    self.local_participant_info.as_ref().ok_or_else(|| {
      create_security_error_and_log!("Local participant identity not validated yet")
    })
  }

  fn get_local_participant_info_mutable(&mut self) -> SecurityResult<&mut LocalParticipantInfo> {
    self.local_participant_info.as_mut().ok_or_else(|| {
      create_security_error_and_log!("Local participant identity not validated yet")
    })
  }

  fn get_remote_participant_info(
    &self,
    handle: &IdentityHandle,
  ) -> SecurityResult<&RemoteParticipantInfo> {
    self
      .remote_participant_infos
      .get(handle)
      .ok_or_else(|| create_security_error_and_log!("Remote identity handle unknown: {handle:?}"))
  }

  fn get_remote_participant_info_mutable(
    &mut self,
    handle: &IdentityHandle,
  ) -> SecurityResult<&mut RemoteParticipantInfo> {
    self
      .remote_participant_infos
      .get_mut(handle)
      .ok_or_else(|| create_security_error_and_log!("Remote identity handle unknown: {handle:?}"))
  }

  fn handshake_handle_to_identity_handle(
    &self,
    handle: &HandshakeHandle,
  ) -> SecurityResult<&IdentityHandle> {
    self
      .handshake_to_identity_handle_map
      .get(handle)
      .ok_or_else(|| create_security_error_and_log!("Handshake handle unknown: {handle:?}"))
  }

  fn generate_random_32_bytes(&self) -> SecurityResult<[u8; 32]> {
    let mut bytes = [0u8; 32];
    self
      .secure_random_generator
      .fill(&mut bytes)
      .map_err(|_| create_security_error_and_log!("Random number generation failed"))?;
    Ok(bytes)
  }
}

impl Default for AuthenticationBuiltin {
  fn default() -> Self {
    Self::new()
  }
}

// ---- GUID binding to the identity certificate --------------------------

/// First 6 bytes of an adjusted GUID prefix, from the certificate subject
/// name: take the leading 8 bytes of SHA-256 over the DER subject as a
/// big-endian u64, shift right one bit, force the first bit to one, keep
/// 48 bits.
pub(crate) fn guid_start_from_certificate(
  identity_cert: &Certificate,
) -> SecurityResult<[u8; 6]> {
  let subject_name_der = identity_cert.subject_name_der()?;
  let subject_name_der_hash = Sha256::hash(&subject_name_der);

  // slice and unwrap will succeed, because input size is static
  let bytes_from_subject_name = ((u64::from_be_bytes(
    subject_name_der_hash.as_ref()[0..8].try_into().unwrap(),
  ) >> 1)
    | 0x8000_0000_0000_0000u64)
    .to_be_bytes();

  let mut guid_start = [0u8; 6];
  guid_start.copy_from_slice(&bytes_from_subject_name[0..6]);
  Ok(guid_start)
}

/// The adjusted participant GUID: the first half of the prefix binds to
/// the certificate subject, the second half to a hash of the candidate
/// GUID; the entity id is preserved.
pub(crate) fn adjusted_guid_from_certificate(
  identity_cert: &Certificate,
  candidate_guid: GUID,
) -> SecurityResult<GUID> {
  let guid_start = guid_start_from_certificate(identity_cert)?;
  let candidate_hash = Sha256::hash(&candidate_guid.to_bytes());

  let mut prefix_bytes = [0u8; 12];
  prefix_bytes[0..6].copy_from_slice(&guid_start);
  prefix_bytes[6..12].copy_from_slice(&candidate_hash.as_ref()[0..6]);

  Ok(GUID::new(
    GuidPrefix::new(&prefix_bytes),
    candidate_guid.entity_id,
  ))
}

/// Checks a remote GUID against its certificate binding.
pub(crate) fn validate_remote_guid(
  remote_guid: GUID,
  remote_identity_cert: &Certificate,
) -> SecurityResult<()> {
  let actual_guid_start = &remote_guid.prefix.as_ref()[0..6];
  let expected_guid_start = guid_start_from_certificate(remote_identity_cert).map_err(|e| {
    create_security_error_and_log!("Could not determine the expected GUID start: {e}")
  })?;

  if actual_guid_start == expected_guid_start {
    Ok(())
  } else {
    Err(create_security_error_and_log!(
      "GUID start {actual_guid_start:?} is not the expected {expected_guid_start:?}"
    ))
  }
}

/// Extracts the participant GUID from PL-CDR serialized participant proxy
/// data (the c.pdata handshake field).
pub(crate) fn participant_guid_from_pdata(pdata: &[u8]) -> SecurityResult<GUID> {
  if pdata.len() < 4 {
    return Err(create_security_error_and_log!(
      "c.pdata too short for an encapsulation header"
    ));
  }
  let endianness = match (pdata[0], pdata[1]) {
    (0x00, 0x02) => Endianness::BigEndian,    // PL_CDR_BE
    (0x00, 0x03) => Endianness::LittleEndian, // PL_CDR_LE
    (a, b) => {
      return Err(create_security_error_and_log!(
        "c.pdata has unknown representation identifier {a:#04x}{b:02x}"
      ));
    }
  };
  let parameter_list = ParameterList::read_from_buffer_with_ctx(endianness, &pdata[4..])
    .map_err(|e| create_security_error_and_log!("Failed to parse c.pdata: {e}"))?;
  parameter_list
    .participant_guid()
    .ok_or_else(|| create_security_error_and_log!("c.pdata carries no participant GUID"))
}

#[cfg(test)]
mod tests {
  use speedy::Writable;

  use super::*;
  use crate::{
    messages::parameter_list::{Parameter, PID_PARTICIPANT_GUID},
    security::test_keys,
    structure::guid::EntityId,
  };

  pub(crate) fn pl_cdr_pdata(guid: GUID, endianness: Endianness) -> Vec<u8> {
    let mut pl = ParameterList::new();
    pl.push(Parameter::new(
      PID_PARTICIPANT_GUID,
      guid.to_bytes().to_vec(),
    ));
    let mut out = match endianness {
      Endianness::BigEndian => vec![0x00, 0x02, 0x00, 0x00],
      Endianness::LittleEndian => vec![0x00, 0x03, 0x00, 0x00],
    };
    out.extend(pl.write_to_vec_with_ctx(endianness).unwrap());
    out
  }

  #[test]
  fn adjusted_guid_is_deterministic_and_flagged() {
    let ca = test_keys::test_ca();
    let identity = test_keys::test_identity(&ca, "Adjusted");
    let cert = Certificate::from_pem(&identity.cert_pem).unwrap();
    let candidate = GUID::new(GuidPrefix::new(&[7; 12]), EntityId::PARTICIPANT);

    let adjusted1 = adjusted_guid_from_certificate(&cert, candidate).unwrap();
    let adjusted2 = adjusted_guid_from_certificate(&cert, candidate).unwrap();
    assert_eq!(adjusted1, adjusted2);

    // first bit of byte 0 is always set by construction
    assert_eq!(adjusted1.prefix.as_ref()[0] & 0x80, 0x80);
    // entity id is preserved
    assert_eq!(adjusted1.entity_id, candidate.entity_id);
    // and the adjusted GUID validates against the certificate
    validate_remote_guid(adjusted1, &cert).unwrap();
  }

  #[test]
  fn foreign_guid_fails_validation() {
    let ca = test_keys::test_ca();
    let identity = test_keys::test_identity(&ca, "Someone");
    let cert = Certificate::from_pem(&identity.cert_pem).unwrap();

    let invalid = GUID::new(GuidPrefix::new(&[1; 12]), EntityId::PARTICIPANT);
    assert!(validate_remote_guid(invalid, &cert).is_err());
  }

  #[test]
  fn pdata_guid_extraction_in_both_endiannesses() {
    let guid = GUID::new(GuidPrefix::new(&[5; 12]), EntityId::PARTICIPANT);
    for endianness in [Endianness::BigEndian, Endianness::LittleEndian] {
      let pdata = pl_cdr_pdata(guid, endianness);
      assert_eq!(participant_guid_from_pdata(&pdata).unwrap(), guid);
    }
    assert!(participant_guid_from_pdata(&[0xca, 0xfe, 0x00, 0x00]).is_err());
  }
}
